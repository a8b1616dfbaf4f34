use std::path::PathBuf;

use directories::BaseDirs;

fn env_home_dir() -> Option<PathBuf> {
    if let Some(home) = std::env::var_os("HOME") {
        if !home.is_empty() {
            return Some(PathBuf::from(home));
        }
    }
    std::env::var_os("USERPROFILE")
        .filter(|profile| !profile.is_empty())
        .map(PathBuf::from)
}

pub fn user_home_dir() -> Option<PathBuf> {
    if let Some(base) = BaseDirs::new() {
        return Some(base.home_dir().to_path_buf());
    }
    env_home_dir()
}

/// `$RUNPLEX_HOME`, else `~/.runplex`. Created on first use.
pub fn runplex_home_dir() -> Result<PathBuf, String> {
    if let Some(override_dir) = std::env::var_os("RUNPLEX_HOME") {
        let path = PathBuf::from(override_dir);
        if path.is_relative() {
            return Err("RUNPLEX_HOME must be an absolute path".to_string());
        }
        std::fs::create_dir_all(&path)
            .map_err(|e| format!("failed to create RUNPLEX_HOME directory: {e}"))?;
        return Ok(path);
    }

    let home = user_home_dir().ok_or_else(|| {
        "failed to resolve user home; set RUNPLEX_HOME or HOME/USERPROFILE".to_string()
    })?;
    let dir = home.join(".runplex");
    std::fs::create_dir_all(&dir).map_err(|e| format!("failed to create ~/.runplex: {e}"))?;
    Ok(dir)
}

pub fn runplex_config_path() -> Result<PathBuf, String> {
    Ok(runplex_home_dir()?.join("config.toml"))
}

/// Expand `~`, and anchor relative paths at the runplex home.
pub fn resolve_path(value: &str) -> Result<PathBuf, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("path override is empty".to_string());
    }
    let home = user_home_dir();
    if let Some(rest) = trimmed.strip_prefix("~/") {
        if let Some(home) = home {
            return Ok(home.join(rest));
        }
    }
    if trimmed == "~" {
        if let Some(home) = home {
            return Ok(home);
        }
    }
    let path = PathBuf::from(trimmed);
    if path.is_relative() {
        return Ok(runplex_home_dir()?.join(path));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_paths_are_kept() {
        let abs = std::env::temp_dir().join("runplex.db");
        let resolved = resolve_path(abs.to_str().unwrap()).unwrap();
        assert_eq!(resolved, abs);
    }

    #[test]
    fn empty_path_is_rejected() {
        assert!(resolve_path("   ").is_err());
    }
}
