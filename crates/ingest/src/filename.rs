use std::fmt;
use crate::error::{IngestError, Result};

/// Season/episode pair identifying an episode record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EpisodeId {
    pub season: u32,
    pub episode: u32,
}

impl fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{:02}E{:02}", self.season, self.episode)
    }
}

/// Parse the episode identifier out of an uploaded file name.
///
/// Two conventions are accepted:
/// - a leading `S<season>E<episode>` tag, case-insensitive (`S01E02 title.mp4`)
/// - the positional form: one season digit at `offset`, then a two-digit
///   episode (`E102.mp4` with offset 1)
///
/// The tag wins when both could apply.
pub fn parse_episode_id(filename: &str, offset: usize) -> Result<EpisodeId> {
    if let Some(id) = parse_tagged(filename) {
        return Ok(id);
    }
    parse_positional(filename, offset)
}

fn parse_tagged(filename: &str) -> Option<EpisodeId> {
    let bytes = filename.as_bytes();
    if !bytes.first()?.eq_ignore_ascii_case(&b'S') {
        return None;
    }

    let season_len = bytes[1..].iter().take_while(|b| b.is_ascii_digit()).count();
    if season_len == 0 {
        return None;
    }
    let e_pos = 1 + season_len;
    if !bytes.get(e_pos)?.eq_ignore_ascii_case(&b'E') {
        return None;
    }
    let episode_len = bytes[e_pos + 1..].iter().take_while(|b| b.is_ascii_digit()).count();
    if episode_len == 0 {
        return None;
    }

    // All sliced bytes are ASCII digits, so the str slices are on char boundaries
    let season = filename[1..e_pos].parse().ok()?;
    let episode = filename[e_pos + 1..e_pos + 1 + episode_len].parse().ok()?;
    Some(EpisodeId { season, episode })
}

fn parse_positional(filename: &str, offset: usize) -> Result<EpisodeId> {
    let invalid = |reason: String| IngestError::InvalidFilenameFormat {
        filename: filename.to_string(),
        reason,
    };

    let chars: Vec<char> = filename.chars().collect();
    if chars.len() < offset + 3 {
        return Err(invalid(format!(
            "expected a season digit at position {} followed by two episode digits",
            offset
        )));
    }

    let season_char = chars[offset];
    let episode_chars = &chars[offset + 1..offset + 3];

    let season = season_char
        .to_digit(10)
        .ok_or_else(|| invalid(format!("season '{}' is not a digit", season_char)))?;

    let mut episode = 0;
    for c in episode_chars {
        let digit = c
            .to_digit(10)
            .ok_or_else(|| invalid(format!("episode '{}' is not a two-digit number", episode_chars.iter().collect::<String>())))?;
        episode = episode * 10 + digit;
    }

    Ok(EpisodeId { season, episode })
}
