//! Relay Identity
//!
//! The relay's long-term ed25519 keypair. The derived peer id is the relay's
//! stable identity on the mesh, so the key is persisted across restarts.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use libp2p::identity::Keypair;
use tracing::{info, warn};

/// Load the identity key from `<dir>/identity.key`, generating (and
/// persisting) a fresh one when the file is missing, unreadable, or `regen`
/// is set. Generation or write failure is fatal; a corrupt existing file is
/// only a warning and triggers regeneration.
pub fn load_or_generate(dir: &Path, regen: bool) -> Result<Keypair> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create persist dir {}", dir.display()))?;
    let path = dir.join("identity.key");

    if !regen && path.exists() {
        match fs::read(&path) {
            Ok(bytes) => match Keypair::from_protobuf_encoding(&bytes) {
                Ok(keypair) => {
                    info!(path = %path.display(), "Loaded identity key");
                    return Ok(keypair);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Corrupt identity key, regenerating");
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable identity key, regenerating");
            }
        }
    }

    let keypair = Keypair::generate_ed25519();
    let bytes = keypair
        .to_protobuf_encoding()
        .context("failed to encode identity key")?;
    fs::write(&path, bytes)
        .with_context(|| format!("failed to write identity key {}", path.display()))?;

    // The key is the relay's whole identity; keep it owner-readable only.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to chmod identity key {}", path.display()))?;
    }

    info!(path = %path.display(), "Generated new identity key");
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_is_reloaded_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_generate(dir.path(), false).unwrap();
        let second = load_or_generate(dir.path(), false).unwrap();
        assert_eq!(
            first.public().to_peer_id(),
            second.public().to_peer_id(),
            "reload must preserve the peer id"
        );
    }

    #[test]
    fn regen_flag_replaces_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_generate(dir.path(), false).unwrap();
        let second = load_or_generate(dir.path(), true).unwrap();
        assert_ne!(first.public().to_peer_id(), second.public().to_peer_id());
    }

    #[test]
    fn corrupt_key_file_regenerates() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("identity.key"), b"not a key").unwrap();
        let keypair = load_or_generate(dir.path(), false).unwrap();
        // The corrupt file was replaced with a loadable one.
        let reloaded = load_or_generate(dir.path(), false).unwrap();
        assert_eq!(
            keypair.public().to_peer_id(),
            reloaded.public().to_peer_id()
        );
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        load_or_generate(dir.path(), false).unwrap();
        let mode = fs::metadata(dir.path().join("identity.key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
