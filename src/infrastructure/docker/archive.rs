//! In-memory tar archives for streaming secret files into containers.

use std::path::{Component, Path};

use tar::{Builder, EntryType, Header};

use crate::domain::errors::{GatewayError, GatewayResult};

/// A secret file to materialize inside a container.
#[derive(Debug, Clone)]
pub struct SecretFileContent {
    /// Absolute path inside the container.
    pub target_path: String,
    /// File mode; parent directories derive theirs from it.
    pub mode: u32,
    pub content: Vec<u8>,
}

/// Directory mode derived from a file mode: each read bit gains the
/// matching execute bit so the path stays traversable.
pub fn dir_mode_for(file_mode: u32) -> u32 {
    let mut mode = file_mode;
    for (read, exec) in [(0o400, 0o100), (0o040, 0o010), (0o004, 0o001)] {
        if file_mode & read != 0 {
            mode |= exec;
        }
    }
    mode
}

/// Build a tar containing parent-directory entries and the file itself,
/// owned by `uid`/`gid`. Extracted at `/` inside the container.
pub fn secret_file_tar(file: &SecretFileContent, uid: u64, gid: u64) -> GatewayResult<Vec<u8>> {
    let path = Path::new(&file.target_path);
    if !path.is_absolute() {
        return Err(GatewayError::Io(format!(
            "secret file path '{}' must be absolute",
            file.target_path
        )));
    }

    let mut builder = Builder::new(Vec::new());
    let dir_mode = dir_mode_for(file.mode);

    let mut prefix = String::new();
    let components: Vec<_> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();
    let (dirs, file_name) = components
        .split_last()
        .map(|(last, rest)| (rest, *last))
        .ok_or_else(|| GatewayError::Io("secret file path has no file name".into()))?;

    for dir in dirs {
        prefix.push_str(dir);
        prefix.push('/');
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_path(&prefix)?;
        header.set_mode(dir_mode);
        header.set_uid(uid);
        header.set_gid(gid);
        header.set_size(0);
        header.set_cksum();
        builder.append(&header, std::io::empty())?;
    }

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_path(format!("{prefix}{file_name}"))?;
    header.set_mode(file.mode);
    header.set_uid(uid);
    header.set_gid(gid);
    header.set_size(file.content.len() as u64);
    header.set_cksum();
    builder.append(&header, file.content.as_slice())?;

    builder.into_inner().map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn dir_mode_adds_execute_per_read_bit() {
        assert_eq!(dir_mode_for(0o600), 0o700);
        assert_eq!(dir_mode_for(0o644), 0o755);
        assert_eq!(dir_mode_for(0o400), 0o500);
        assert_eq!(dir_mode_for(0o640), 0o750);
    }

    #[test]
    fn tar_contains_parents_and_file() {
        let file = SecretFileContent {
            target_path: "/home/agent/.ssh/id_ed25519".into(),
            mode: 0o600,
            content: b"KEY".to_vec(),
        };
        let bytes = secret_file_tar(&file, 1000, 1000).unwrap();

        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut entries = archive.entries().unwrap();

        let mut paths = Vec::new();
        let mut file_body = Vec::new();
        while let Some(Ok(mut entry)) = entries.next() {
            let path = entry.path().unwrap().display().to_string();
            let mode = entry.header().mode().unwrap();
            if entry.header().entry_type() == EntryType::Directory {
                assert_eq!(mode, 0o700, "dir {path}");
            } else {
                assert_eq!(mode, 0o600);
                entry.read_to_end(&mut file_body).unwrap();
            }
            paths.push(path);
        }
        assert_eq!(
            paths,
            vec![
                "home/",
                "home/agent/",
                "home/agent/.ssh/",
                "home/agent/.ssh/id_ed25519"
            ]
        );
        assert_eq!(file_body, b"KEY");
    }

    #[test]
    fn relative_path_is_rejected() {
        let file = SecretFileContent {
            target_path: "relative/path".into(),
            mode: 0o600,
            content: Vec::new(),
        };
        assert!(secret_file_tar(&file, 0, 0).is_err());
    }
}
