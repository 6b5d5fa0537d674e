use std::env;
use std::path::PathBuf;

/// Layered config paths, lowest precedence first: the home-level config,
/// then the project-level config in the working directory. Each location is
/// probed in both YAML and JSON spellings; an existing YAML file shadows its
/// JSON twin. Only files that exist are returned.
pub fn config_layers() -> Vec<PathBuf> {
    let mut candidates: Vec<[PathBuf; 2]> = Vec::new();

    if let Some(home) = home_config_dir() {
        candidates.push([home.join("config.yaml"), home.join("config.json")]);
    }

    candidates.push([PathBuf::from(".rigger.yaml"), PathBuf::from(".rigger.json")]);

    candidates
        .into_iter()
        .filter_map(|pair| pair.into_iter().find(|p| p.exists()))
        .collect()
}

/// Base rigger config directory (~/.config/rigger/).
fn home_config_dir() -> Option<PathBuf> {
    let home = env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".config").join("rigger"))
}

/// Directory for host-scoped lock files.
pub fn lock_dir() -> PathBuf {
    env::var("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
