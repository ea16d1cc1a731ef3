use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

pub const CONTENT_TYPE_JPEG: &str = "image/jpeg";
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Write-only blob store for uncertain-frame samples.
pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()>;

    fn describe(&self) -> String;
}

/// Object storage connection settings.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub bucket: String,
    pub token: Option<String>,
    pub local_dir: Option<PathBuf>,
    pub request_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            bucket: "cart-uncertain".to_string(),
            token: None,
            local_dir: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Pick a store from config. A local directory wins over a remote endpoint;
/// with neither, uncertain capture is disabled.
pub fn open_object_store(config: &StorageConfig) -> Result<Option<Box<dyn ObjectStore>>> {
    if let Some(dir) = &config.local_dir {
        return Ok(Some(Box::new(FilesystemObjectStore::new(dir)?)));
    }
    if let Some(endpoint) = &config.endpoint {
        return Ok(Some(Box::new(HttpObjectStore::new(
            endpoint,
            &config.bucket,
            config.token.clone(),
            config.request_timeout,
        )?)));
    }
    Ok(None)
}

/// Keys are relative, `/`-separated, and free of `.`/`..` segments.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(anyhow!("object key is empty"));
    }
    if key.starts_with('/') || key.contains('\\') {
        return Err(anyhow!("object key must be relative: {}", key));
    }
    for segment in key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(anyhow!("object key has invalid segment: {}", key));
        }
    }
    Ok(())
}

/// PUT `{endpoint}/{bucket}/{key}` against an S3-compatible gateway.
pub struct HttpObjectStore {
    agent: ureq::Agent,
    base: url::Url,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(
        endpoint: &str,
        bucket: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        if bucket.is_empty() || bucket.contains('/') {
            return Err(anyhow!("invalid storage bucket: {:?}", bucket));
        }
        let mut base = url::Url::parse(endpoint)
            .with_context(|| format!("parse storage endpoint {}", endpoint))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("storage endpoint cannot be a base url: {}", endpoint));
        }
        let path = format!("{}/{}/", base.path().trim_end_matches('/'), bucket);
        base.set_path(&path);
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self { agent, base, token })
    }

    pub fn object_url(&self, key: &str) -> Result<url::Url> {
        validate_key(key)?;
        self.base
            .join(key)
            .with_context(|| format!("build object url for {}", key))
    }
}

impl ObjectStore for HttpObjectStore {
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        let url = self.object_url(key)?;
        let mut request = self
            .agent
            .put(url.as_str())
            .set("Content-Type", content_type);
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("Bearer {}", token));
        }
        match request.send_bytes(bytes) {
            Ok(response) if (200..300).contains(&response.status()) => Ok(()),
            Ok(response) => Err(anyhow!(
                "object store returned status {} for {}",
                response.status(),
                key
            )),
            Err(ureq::Error::Status(code, _)) => {
                Err(anyhow!("object store returned status {} for {}", code, key))
            }
            Err(ureq::Error::Transport(err)) => {
                Err(anyhow!("object store transport error for {}: {}", key, err))
            }
        }
    }

    fn describe(&self) -> String {
        self.base.to_string()
    }
}

/// Objects as files under a local root.
pub struct FilesystemObjectStore {
    root: PathBuf,
}

impl FilesystemObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("create storage dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(anyhow!("object key escapes storage root: {}", key));
        }
        Ok(self.root.join(relative))
    }
}

impl ObjectStore for FilesystemObjectStore {
    fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<()> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("object path has no parent: {}", path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("create object dir {}", parent.display()))?;

        let tmp = path.with_extension("partial");
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("create {}", tmp.display()))?;
            file.write_all(bytes)
                .with_context(|| format!("write {}", tmp.display()))?;
            file.sync_all()
                .with_context(|| format!("sync {}", tmp.display()))?;
        }
        fs::rename(&tmp, &path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filesystem_store_writes_nested_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path()).unwrap();
        store
            .put("uncertain/CART-1/123-ab.json", b"{}", CONTENT_TYPE_JSON)
            .unwrap();

        let written = dir.path().join("uncertain/CART-1/123-ab.json");
        assert_eq!(fs::read(&written).unwrap(), b"{}");
        assert!(!dir.path().join("uncertain/CART-1/123-ab.partial").exists());
    }

    #[test]
    fn filesystem_store_overwrites_existing_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path()).unwrap();
        store.put("a/b.jpg", b"one", CONTENT_TYPE_JPEG).unwrap();
        store.put("a/b.jpg", b"two", CONTENT_TYPE_JPEG).unwrap();
        assert_eq!(fs::read(dir.path().join("a/b.jpg")).unwrap(), b"two");
    }

    #[test]
    fn keys_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path()).unwrap();
        for key in ["../x.jpg", "/etc/passwd", "a//b", "a/./b", "", "a\\b"] {
            assert!(store.put(key, b"x", CONTENT_TYPE_JPEG).is_err(), "{}", key);
        }
    }

    #[test]
    fn http_store_builds_bucket_urls() {
        let store = HttpObjectStore::new(
            "http://127.0.0.1:9000/storage/",
            "cart-uncertain",
            None,
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            store.object_url("uncertain/CART-1/1.jpg").unwrap().as_str(),
            "http://127.0.0.1:9000/storage/cart-uncertain/uncertain/CART-1/1.jpg"
        );
        assert!(HttpObjectStore::new("http://h", "a/b", None, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn store_selection_prefers_local_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            endpoint: Some("http://127.0.0.1:9000".to_string()),
            local_dir: Some(dir.path().to_path_buf()),
            ..StorageConfig::default()
        };
        let store = open_object_store(&config).unwrap().unwrap();
        assert!(store.describe().starts_with("file://"));
        assert!(open_object_store(&StorageConfig::default()).unwrap().is_none());
    }
}
