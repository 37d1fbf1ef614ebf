use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing::info;

/// Write the assembled bytes under the name the peripheral declared, appending
///  `_1`, `_2`, ... before the extension rather than overwriting an existing
///  file. Returns the path actually written.
pub fn save_unique(dir: &Path, name: &str, data: &[u8]) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating output directory {:?}", dir))?;

    let original = dir.join(name);
    let mut path = original.clone();
    let mut counter = 1;
    while path.exists() {
        let stem = original
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(name);
        let suffixed = match original.extension().and_then(|ext| ext.to_str()) {
            Some(ext) => format!("{}_{}.{}", stem, counter, ext),
            None => format!("{}_{}", stem, counter),
        };
        path = dir.join(suffixed);
        counter += 1;
    }

    std::fs::write(&path, data).with_context(|| format!("writing {:?}", path))?;
    info!("saved {:?} ({} bytes)", path, data.len());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(test_name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "blefetch-{}-{}",
            test_name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_saves_under_declared_name() {
        let dir = temp_dir("plain");
        let path = save_unique(&dir, "clip.wav", b"abc").unwrap();

        assert_eq!(path, dir.join("clip.wav"));
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }

    #[test]
    fn test_never_overwrites_existing_files() {
        let dir = temp_dir("collision");
        let first = save_unique(&dir, "clip.wav", b"first").unwrap();
        let second = save_unique(&dir, "clip.wav", b"second").unwrap();
        let third = save_unique(&dir, "clip.wav", b"third").unwrap();

        assert_eq!(first, dir.join("clip.wav"));
        assert_eq!(second, dir.join("clip_1.wav"));
        assert_eq!(third, dir.join("clip_2.wav"));
        assert_eq!(std::fs::read(&first).unwrap(), b"first");
        assert_eq!(std::fs::read(&second).unwrap(), b"second");
        assert_eq!(std::fs::read(&third).unwrap(), b"third");
    }

    #[test]
    fn test_collision_naming_without_extension() {
        let dir = temp_dir("noext");
        let first = save_unique(&dir, "clip", b"first").unwrap();
        let second = save_unique(&dir, "clip", b"second").unwrap();

        assert_eq!(first, dir.join("clip"));
        assert_eq!(second, dir.join("clip_1"));
    }
}
