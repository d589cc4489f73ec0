//! Token generation and local token persistence.

use std::collections::HashSet;
use std::path::Path;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Generate `count` random tokens, none of which appear in `taken`.
///
/// Tokens are returned unsorted; the ring view sorts the combined token set
/// at ingest. Uniqueness within the returned set is guaranteed, so two equal
/// tokens can only meet through a join race (and are then resolved by the
/// observe period).
pub fn generate_tokens(count: usize, taken: &[u32]) -> Vec<u32> {
    let mut used = taken.iter().copied().collect::<HashSet<_>>();
    let mut rng = SmallRng::from_entropy();

    let mut tokens = Vec::with_capacity(count);
    while tokens.len() < count {
        let candidate = rng.gen::<u32>();
        if used.insert(candidate) {
            tokens.push(candidate);
        }
    }
    tokens
}

/// The JSON document persisted at `tokens_file_path`.
///
/// Keeping tokens across restarts keeps an instance's placement stable: a
/// process that comes back re-claims the ring positions it held before.
#[derive(Debug, Serialize, Deserialize)]
struct TokensFile {
    version: u32,
    tokens: Vec<u32>,
}

const TOKENS_FILE_VERSION: u32 = 1;

/// Errors reading or writing the tokens file.
#[derive(Debug, thiserror::Error)]
pub enum TokensFileError {
    /// The file could not be read or written.
    #[error("tokens file i/o: {0}")]
    Io(#[from] std::io::Error),

    /// The file exists but does not contain a valid tokens document.
    #[error("tokens file malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The file was written by an incompatible version.
    #[error("unexpected tokens file version {0}")]
    UnexpectedVersion(u32),
}

/// Load previously persisted tokens from `path`, returning `None` if the
/// file does not exist.
pub fn load_tokens_file(path: &Path) -> Result<Option<Vec<u32>>, TokensFileError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let file: TokensFile = serde_json::from_slice(&raw)?;
    if file.version != TOKENS_FILE_VERSION {
        return Err(TokensFileError::UnexpectedVersion(file.version));
    }
    Ok(Some(file.tokens))
}

/// Persist `tokens` to `path`, replacing any previous content.
pub fn save_tokens_file(path: &Path, tokens: &[u32]) -> Result<(), TokensFileError> {
    let file = TokensFile {
        version: TOKENS_FILE_VERSION,
        tokens: tokens.to_vec(),
    };
    let raw = serde_json::to_vec(&file)?;

    // Write-then-rename so a crash mid-write never leaves a truncated file
    // to be misread on restart.
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, raw)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_tokens_disjoint_from_taken() {
        let taken = generate_tokens(128, &[]);
        assert_eq!(taken.len(), 128);

        let tokens = generate_tokens(128, &taken);
        assert_eq!(tokens.len(), 128);

        let taken = taken.into_iter().collect::<HashSet<_>>();
        for token in &tokens {
            assert!(!taken.contains(token), "token {token} already taken");
        }

        // And unique within the generated set itself.
        let unique = tokens.iter().collect::<HashSet<_>>();
        assert_eq!(unique.len(), tokens.len());
    }

    #[test]
    fn test_generate_zero_tokens() {
        assert!(generate_tokens(0, &[1, 2, 3]).is_empty());
    }

    #[test]
    fn test_tokens_file_round_trip() {
        let dir = test_helpers::tmp_dir().unwrap();
        let path = dir.path().join("tokens");

        assert!(load_tokens_file(&path).unwrap().is_none());

        let tokens = vec![4, 8, 15, 16, 23, 42];
        save_tokens_file(&path, &tokens).unwrap();

        let got = load_tokens_file(&path).unwrap();
        assert_eq!(got, Some(tokens));
    }

    #[test]
    fn test_tokens_file_rejects_garbage() {
        let file = test_helpers::make_temp_file("{not json");
        load_tokens_file(file.path()).expect_err("garbage must not load");
    }

    #[test]
    fn test_tokens_file_rejects_unknown_version() {
        let file = test_helpers::make_temp_file(r#"{"version":9,"tokens":[]}"#);
        let err = load_tokens_file(file.path()).expect_err("unknown version must not load");
        assert!(matches!(err, TokensFileError::UnexpectedVersion(9)));
    }
}
