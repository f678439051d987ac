use std::{env, path::PathBuf};

use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};

const ID_LENGTH: usize = 9;
const ID_ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

// matches the seed used by the original generator so a single process
// yields a stable stream
const ID_DEFAULT_SEED: u64 = 2342;

fn get_dir(test_env: bool) -> Result<PathBuf, std::io::Error> {
    let dir = if test_env {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    } else {
        let mut d = env::current_exe()?;
        d.pop();
        d
    };
    Ok(dir)
}

pub fn config_dir(test_env: bool, subdir: Option<Vec<String>>) -> Result<PathBuf, std::io::Error> {
    let mut dir = get_dir(test_env)?;
    dir.push("configs");
    if test_env {
        if let Some(v) = subdir {
            for d in v {
                dir.push(d);
            }
        }
    }
    Ok(dir)
}

pub fn log_dir(test_env: bool) -> Result<PathBuf, std::io::Error> {
    let mut dir = get_dir(test_env)?;
    dir.push("logs");
    Ok(dir)
}

pub fn ref_to_digit(v: &str) -> Result<u8, String> {
    if !v.starts_with(':') {
        return Err("doesn't begin with :".to_string());
    }
    let n = v.replace(':', "").parse::<u8>().map_err(|e| e.to_string())?;
    Ok(n)
}

/// Short URL-safe backlog ID source. Seeded once at construction, so the
/// stream is deterministic within a process; cross-process uniqueness isn't
/// required.
pub struct IdGenerator {
    rng: Mutex<SmallRng>,
}

impl Default for IdGenerator {
    fn default() -> Self {
        IdGenerator::with_seed(ID_DEFAULT_SEED)
    }
}

impl IdGenerator {
    pub fn with_seed(seed: u64) -> Self {
        IdGenerator { rng: Mutex::new(SmallRng::seed_from_u64(seed)) }
    }

    pub fn generate(&self) -> String {
        let mut rng = self.rng.lock();
        (0..ID_LENGTH).map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char).collect()
    }
}
