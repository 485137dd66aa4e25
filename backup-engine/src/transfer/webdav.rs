//! WebDAV (HTTP file store) backend.

use super::counting_stream::CountingStream;
use super::{pipeline, remote_parent, Direction, TransferJob, TransferStat, TransportBackend};
use crate::config::WebDavStorage;
use crate::model::naming;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use regex::Regex;
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use std::sync::atomic::Ordering;
use std::sync::LazyLock;
use std::time::Duration;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info};

static RESPONSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:[a-z0-9]+:)?response\b.*?</(?:[a-z0-9]+:)?response\s*>").expect("valid response pattern")
});
static HREF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<(?:[a-z0-9]+:)?href>([^<]+)</(?:[a-z0-9]+:)?href>").expect("valid href pattern")
});
static COLLECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<(?:[a-z0-9]+:)?collection\s*/?>").expect("valid collection pattern"));

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?><propfind xmlns="DAV:"><prop><resourcetype/></prop></propfind>"#;

pub struct WebDavBackend {
    client: reqwest::Client,
    base: Url,
    username: Option<String>,
    password: Option<String>,
    level: u32,
}

fn method(name: &str) -> Result<Method> {
    Method::from_bytes(name.as_bytes()).map_err(|e| EngineError::Config(e.to_string()))
}

fn check(response: Response, url: &str) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else if response.status() == StatusCode::NOT_FOUND {
        Err(EngineError::SourceNotFound(url.to_string()))
    } else {
        Err(EngineError::HttpStatus {
            status: response.status().as_u16(),
            url: url.to_string(),
        })
    }
}

/// Backup names among the collections of a PROPFIND multistatus body.
fn parse_listing(body: &str) -> Vec<String> {
    let mut names: Vec<String> = RESPONSE_RE
        .find_iter(body)
        .map(|response| response.as_str())
        .filter(|response| COLLECTION_RE.is_match(response))
        .filter_map(|response| HREF_RE.captures(response).and_then(|caps| caps.get(1)))
        .filter_map(|href| href.as_str().trim().trim_end_matches('/').rsplit('/').next().map(str::to_string))
        .filter(|name| naming::is_backup_name(name))
        .collect();
    names.sort();
    names.dedup();
    names
}

impl WebDavBackend {
    pub fn new(settings: &WebDavStorage, level: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(settings.skip_verify)
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        let base = Url::parse(&settings.base_url()).map_err(|e| EngineError::Config(format!("webdav url: {e}")))?;
        info!(url = %base, "Using WebDAV storage");
        Ok(Self {
            client,
            base,
            username: settings.username.clone(),
            password: settings.password.clone(),
            level,
        })
    }

    /// URL of `path` under the storage root, every segment percent-encoded.
    /// A trailing `/` is kept for collections.
    fn url(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(path.split('/').filter(|p| !p.is_empty()));
            if path.ends_with('/') {
                segments.push("");
            }
        }
        url
    }

    fn request(&self, method: Method, url: &Url) -> RequestBuilder {
        let builder = self.client.request(method, url.clone());
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    /// Create every collection on the way to `dir`.
    async fn make_collections(&self, dir: &str) -> Result<()> {
        let mkcol = method("MKCOL")?;
        let mut current = String::new();
        for part in dir.split('/').filter(|p| !p.is_empty()) {
            current.push_str(part);
            current.push('/');
            let url = self.url(&current);
            let response = self.request(mkcol.clone(), &url).send().await?;
            match response.status() {
                s if s.is_success() => debug!("Created collection {}", url),
                // already exists
                StatusCode::METHOD_NOT_ALLOWED => {}
                s => {
                    return Err(EngineError::HttpStatus {
                        status: s.as_u16(),
                        url: url.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    async fn store(&self, job: &TransferJob) -> Result<TransferStat> {
        let path = job.archive_path();
        if let Some(parent) = remote_parent(&path) {
            self.make_collections(parent).await?;
        }

        let source = tokio::fs::File::open(&job.local_path)
            .await
            .map_err(|e| EngineError::from_io(e, job.local_path.display().to_string()))?;
        let (encoder, probe) = pipeline::encoder(source, self.level);
        let (body, sent) = CountingStream::new(ReaderStream::new(encoder), path.clone());

        let url = self.url(&path);
        let response = self
            .request(Method::PUT, &url)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;
        check(response, url.as_str())?;

        Ok(TransferStat {
            size: probe.bytes() as i64,
            bsize: sent.load(Ordering::Relaxed) as i64,
            sha1: probe.hex_digest(),
        })
    }

    async fn fetch(&self, job: &TransferJob) -> Result<TransferStat> {
        let url = self.url(&job.archive_path());
        let response = check(self.request(Method::GET, &url).send().await?, url.as_str())?;
        let body = StreamReader::new(Box::pin(response.bytes_stream().map_err(std::io::Error::other)));

        if let Some(parent) = job.local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut dest = tokio::fs::File::create(&job.local_path).await?;
        let stat = pipeline::decompress(body, &mut dest).await?;
        job.verify(&stat)?;
        Ok(stat)
    }
}

#[async_trait]
impl TransportBackend for WebDavBackend {
    fn kind(&self) -> &'static str {
        "webdav"
    }

    async fn transfer_file(&self, job: &TransferJob) -> Result<TransferStat> {
        match job.direction {
            Direction::Backup => self.store(job).await,
            Direction::Restore => self.fetch(job).await,
        }
    }

    async fn read_metadata(&self, path: &str) -> Result<Vec<u8>> {
        let url = self.url(path);
        let response = check(self.request(Method::GET, &url).send().await?, url.as_str())?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn write_metadata(&self, path: &str, content: &[u8]) -> Result<()> {
        if let Some(parent) = remote_parent(path) {
            self.make_collections(parent).await?;
        }
        let url = self.url(path);
        let response = self.request(Method::PUT, &url).body(content.to_vec()).send().await?;
        check(response, url.as_str())?;
        Ok(())
    }

    async fn list_backup_names(&self) -> Result<Vec<String>> {
        let response = self
            .request(method("PROPFIND")?, &self.base)
            .header("Depth", "1")
            .header("Content-Type", "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await?;
        let body = match check(response, self.base.as_str()) {
            Ok(response) => response.text().await?,
            Err(EngineError::SourceNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(parse_listing(&body))
    }

    async fn delete_backup(&self, name: &str) -> Result<()> {
        naming::validate(name)?;
        let url = self.url(&format!("{name}/"));
        let response = self.request(Method::DELETE, &url).send().await?;
        match check(response, url.as_str()) {
            Ok(_) | Err(EngineError::SourceNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
