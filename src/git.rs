//! Push-side integration: deploy users, SSH key authorization for a
//! repository and registration of freshly built slug archives.

use crate::error::{ConfigError, DeployError};
use crate::registry::Registry;
use crate::slug::SlugName;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A deploy user from `users.d/<name>.toml`
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct User {
    #[serde(default)]
    pub name: String,

    #[serde(default, alias = "audit-log")]
    pub audit_log: Option<PathBuf>,

    #[serde(default)]
    pub applications: Vec<String>,

    #[serde(default, alias = "ssh-keys")]
    pub ssh_keys: Vec<String>,
}

impl User {
    pub fn can_deploy(&self, app: &str) -> bool {
        self.applications.iter().any(|a| a == app)
    }

    pub fn has_key(&self, key: &str) -> bool {
        let Some(id) = key_identity(key) else {
            return false;
        };
        self.ssh_keys
            .iter()
            .filter_map(|k| key_identity(k))
            .any(|known| known == id)
    }

    /// Append a line to the user's audit log, if one is configured
    pub fn audit(&self, message: &str) {
        let Some(path) = &self.audit_log else {
            info!(user = %self.name, "{}", message);
            return;
        };
        let line = format!(
            "[{}] [user:{}] {}\n",
            chrono::Local::now().format("%Y%m%d-%H%M%S"),
            self.name,
            message
        );
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!(user = %self.name, path = %path.display(), error = %e, "Failed to write audit log");
        }
    }
}

/// Load every user file. A user without a `name` is named after its file.
pub fn load_users(dir: &Path) -> Result<Vec<User>, ConfigError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    files.sort();

    let mut users = Vec::with_capacity(files.len());
    for path in files {
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let mut user: User = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        if user.name.is_empty() {
            user.name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        users.push(user);
    }
    Ok(users)
}

/// `"<type> <base64>"` with any comment dropped, or `None` if the key does
/// not look like an OpenSSH public key
pub fn key_identity(key: &str) -> Option<String> {
    let mut fields = key.split_whitespace();
    let kind = fields.next()?;
    let blob = fields.next()?;
    if !(kind.starts_with("ssh-") || kind.starts_with("ecdsa-") || kind.starts_with("sk-")) {
        return None;
    }
    STANDARD.decode(blob).ok()?;
    Some(format!("{} {}", kind, blob))
}

/// OpenSSH-style `SHA256:` fingerprint of a public key
pub fn key_fingerprint(key: &str) -> Option<String> {
    let blob = key.split_whitespace().nth(1)?;
    let decoded = STANDARD.decode(blob).ok()?;
    let digest = Sha256::digest(&decoded);
    Some(format!("SHA256:{}", STANDARD_NO_PAD.encode(digest)))
}

/// Outcome of a successful key check
#[derive(Debug, Clone, PartialEq)]
pub struct Authorization {
    pub user: String,
    pub app: String,
    pub fingerprint: String,
}

/// Is `key` allowed to push to `repo`? The repository name may carry a
/// `.git` suffix or a leading path.
pub fn authorize_key(registry: &Registry, repo: &str, key: &str) -> Option<Authorization> {
    let app = repo_app_name(repo);
    registry.app(app)?;
    let fingerprint = key_fingerprint(key)?;

    let users = registry.users();
    let user = users.iter().find(|u| u.can_deploy(app) && u.has_key(key));
    match user {
        Some(user) => {
            user.audit(&format!("authorized {} for {}", fingerprint, app));
            Some(Authorization {
                user: user.name.clone(),
                app: app.to_string(),
                fingerprint,
            })
        }
        None => {
            debug!(app, %fingerprint, "Key is not authorized");
            None
        }
    }
}

fn repo_app_name(repo: &str) -> &str {
    let base = repo.trim_end_matches('/').rsplit('/').next().unwrap_or(repo);
    base.strip_suffix(".git").unwrap_or(base)
}

/// A registered archive
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredSlug {
    pub app: String,
    pub archive: PathBuf,
    /// False when the archive is the one already serving
    pub queued: bool,
}

/// Move a finished archive into the slugs directory and make it the
/// application's next slug. The deployment itself is started by the caller.
pub fn register_built_slug(registry: &Registry, archive: &Path) -> Result<RegisteredSlug, DeployError> {
    let name = SlugName::parse(archive)?;
    let app = registry
        .app(&name.app)
        .ok_or_else(|| DeployError::UnknownApp(name.app.clone()))?;
    if !archive.is_file() {
        return Err(DeployError::ArchiveMissing(archive.to_path_buf()));
    }

    let config = registry.config();
    let slugs_dir = config.paths.slugs_dir();
    std::fs::create_dir_all(&slugs_dir)?;
    let destination = slugs_dir.join(name.file_name());
    if archive != destination {
        move_file(archive, &destination)?;
    }

    let queued = app.this_slug().as_deref() != Some(destination.as_path());
    if queued {
        app.update(|d| d.next_slug = Some(destination.clone()))?;
        info!(app = %name.app, slug = %destination.display(), "Registered next slug");
    } else {
        info!(app = %name.app, slug = %destination.display(), "Archive is already serving");
    }

    Ok(RegisteredSlug {
        app: name.app,
        archive: destination,
        queued,
    })
}

fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{test_config, write_app};

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl alice@laptop";
    const OTHER: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBsGq7hBGbJbpvw0m8ST4Yd0AoAU0D5TEwNZa4ltITTt bob@desk";

    #[test]
    fn test_key_identity_ignores_comment() {
        let a = key_identity(KEY).unwrap();
        let b = key_identity(&KEY.replace("alice@laptop", "other-comment")).unwrap();
        assert_eq!(a, b);
        assert!(!a.contains("alice"));
        assert_eq!(key_identity("not a key"), None);
        assert_eq!(key_identity("ssh-ed25519 !!!notbase64"), None);
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = key_fingerprint(KEY).unwrap();
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        assert_ne!(fp, key_fingerprint(OTHER).unwrap());
    }

    #[test]
    fn test_repo_app_name() {
        assert_eq!(repo_app_name("blog.git"), "blog");
        assert_eq!(repo_app_name("/var/repos.d/blog.git"), "blog");
        assert_eq!(repo_app_name("blog"), "blog");
    }

    #[test]
    fn test_authorize_key() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        write_app(&config, "blog", "blog.test", 4201);
        write_app(&config, "shop", "shop.test", 4202);
        let audit = dir.path().join("alice.audit.log");
        std::fs::write(
            config.paths.users_dir().join("alice.toml"),
            format!(
                "audit-log = \"{}\"\napplications = [\"blog\"]\nssh-keys = [\"{}\"]\n",
                audit.display(),
                KEY
            ),
        )
        .unwrap();
        let registry = Registry::load(config).unwrap();

        let auth = authorize_key(&registry, "blog.git", KEY).unwrap();
        assert_eq!(auth.user, "alice");
        assert_eq!(auth.app, "blog");
        assert!(std::fs::read_to_string(&audit).unwrap().contains("authorized SHA256:"));

        assert!(authorize_key(&registry, "shop.git", KEY).is_none());
        assert!(authorize_key(&registry, "blog.git", OTHER).is_none());
        assert!(authorize_key(&registry, "missing.git", KEY).is_none());
    }

    #[test]
    fn test_register_built_slug_sets_next_slug() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let source = write_app(&config, "blog", "blog.test", 4201);
        let registry = Registry::load(config.clone()).unwrap();
        let build = dir.path().join("build");
        std::fs::create_dir_all(&build).unwrap();
        let archive = build.join("blog--abc123.zip");
        std::fs::write(&archive, b"zip").unwrap();

        let registered = register_built_slug(&registry, &archive).unwrap();

        let expected = config.paths.slugs_dir().join("blog--abc123.zip");
        assert!(registered.queued);
        assert_eq!(registered.archive, expected);
        assert!(expected.is_file());
        assert!(!archive.exists());
        assert_eq!(registry.app("blog").unwrap().next_slug(), Some(expected));
        assert!(std::fs::read_to_string(source).unwrap().contains("next_slug"));
    }

    #[test]
    fn test_register_serving_slug_is_not_queued() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        write_app(&config, "blog", "blog.test", 4201);
        let registry = Registry::load(config.clone()).unwrap();
        let archive = config.paths.slugs_dir().join("blog--abc123.zip");
        std::fs::write(&archive, b"zip").unwrap();
        registry.commit_transition("blog", &archive, 4201).unwrap();

        let registered = register_built_slug(&registry, &archive).unwrap();

        assert!(!registered.queued);
        assert_eq!(registry.app("blog").unwrap().next_slug(), None);
    }

    #[test]
    fn test_register_rejects_bad_names() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        write_app(&config, "blog", "blog.test", 4201);
        let registry = Registry::load(config).unwrap();

        let bad = dir.path().join("blog-abc123.zip");
        std::fs::write(&bad, b"zip").unwrap();
        assert!(matches!(
            register_built_slug(&registry, &bad),
            Err(DeployError::InvalidSlugName(_))
        ));

        let unknown = dir.path().join("wiki--abc123.zip");
        std::fs::write(&unknown, b"zip").unwrap();
        assert!(matches!(
            register_built_slug(&registry, &unknown),
            Err(DeployError::UnknownApp(_))
        ));
    }
}
