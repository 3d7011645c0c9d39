//! google cloud storage backend over the JSON API
//!
//! small payloads use a single media upload; large payloads use a resumable
//! session which only produces an object (and a generation) when the final
//! chunk is accepted. reads always pin the generation they were asked for.

use std::io::{self, Read, Write};

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, info};

use super::{Blob, BlobId, BlobWriter, Generation, VersionStore};
use crate::error::{Error, Result};

/// default public endpoint
pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// resumable chunks must be a multiple of 256 KiB
const CHUNK_SIZE: usize = 4 * 256 * 1024;

/// object resource as returned by the JSON API (only fields we use)
#[derive(Debug, Deserialize)]
struct ObjectResource {
    name: String,
    generation: String,
    #[serde(default)]
    size: Option<String>,
}

impl ObjectResource {
    fn generation(&self) -> Result<Generation> {
        self.generation.parse()
    }
}

#[derive(Debug, Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectResource>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

/// blob store talking to GCS (or an API-compatible emulator)
#[derive(Clone)]
pub struct GcsStore {
    client: Client,
    endpoint: Url,
    token: Option<String>,
}

impl GcsStore {
    /// create a store for `endpoint`, authenticating with a bearer token if given
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::Backend(format!("invalid endpoint {endpoint}: {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(Error::Backend(format!("endpoint cannot be a base url: {endpoint}")));
        }
        // resumable uploads answer 308 without a location; never follow it
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Backend(format!("failed to create http client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            token,
        })
    }

    /// create a store reading its bearer token from an environment variable
    ///
    /// a missing variable means unauthenticated requests (useful for emulators).
    pub fn from_env(endpoint: &str, token_var: &str) -> Result<Self> {
        let token = std::env::var(token_var).ok().filter(|t| !t.is_empty());
        if token.is_none() {
            info!(var = token_var, "no gcs token in environment, sending unauthenticated requests");
        }
        Self::new(endpoint, token)
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.endpoint.clone();
        // checked in new(): the endpoint can be a base
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// metadata / media url for one object
    fn object_url(&self, id: &BlobId) -> Url {
        self.url(&["storage", "v1", "b", id.bucket.as_str(), "o", id.path.as_str()])
    }

    /// upload endpoint for a bucket
    fn upload_url(&self, bucket: &str) -> Url {
        self.url(&["upload", "storage", "v1", "b", bucket, "o"])
    }

    /// listing endpoint for a bucket
    fn list_url(&self, bucket: &str) -> Url {
        self.url(&["storage", "v1", "b", bucket, "o"])
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn send(&self, req: RequestBuilder, what: &str) -> Result<Response> {
        let resp = self
            .authorize(req)
            .send()
            .map_err(|e| Error::transport(format!("{what}: {e}")))?;
        check_status(resp, what)
    }
}

/// map http failures onto the error taxonomy
fn check_status(resp: Response, what: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() || status == StatusCode::PERMANENT_REDIRECT {
        return Ok(resp);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(Error::NotFound(what.to_string()));
    }
    let body = resp.text().unwrap_or_default();
    Err(Error::transport(format!("{what}: http {status}: {body}")))
}

/// Content-Range header for a resumable chunk
fn content_range(offset: u64, len: usize, total: Option<u64>) -> String {
    let total = total.map(|t| t.to_string()).unwrap_or_else(|| "*".to_string());
    if len == 0 {
        format!("bytes */{total}")
    } else {
        format!("bytes {}-{}/{}", offset, offset + len as u64 - 1, total)
    }
}

impl VersionStore for GcsStore {
    fn get(&self, id: &BlobId) -> Result<Blob> {
        let what = id.to_string();
        let req = self
            .client
            .get(self.object_url(id))
            .query(&[("fields", "name,generation,size")]);
        let object: ObjectResource = self
            .send(req, &what)?
            .json()
            .map_err(|e| Error::transport(format!("{what}: bad metadata: {e}")))?;

        Ok(Blob {
            id: id.clone(),
            generation: object.generation()?,
            size: object.size.as_deref().and_then(|s| s.parse().ok()),
        })
    }

    fn create(&self, id: &BlobId, content: &[u8]) -> Result<Generation> {
        let what = id.to_string();
        let req = self
            .client
            .post(self.upload_url(&id.bucket))
            .query(&[("uploadType", "media"), ("name", id.path.as_str())])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(content.to_vec());
        let object: ObjectResource = self
            .send(req, &what)?
            .json()
            .map_err(|e| Error::transport(format!("{what}: bad upload response: {e}")))?;

        let generation = object.generation()?;
        debug!(blob = %id, %generation, bytes = content.len(), "uploaded object");
        Ok(generation)
    }

    fn writer(&self, id: &BlobId) -> Result<Box<dyn BlobWriter>> {
        let what = id.to_string();
        let req = self
            .client
            .post(self.upload_url(&id.bucket))
            .query(&[("uploadType", "resumable"), ("name", id.path.as_str())])
            .header(reqwest::header::CONTENT_LENGTH, "0");
        let resp = self.send(req, &what)?;

        let session = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::transport(format!("{what}: no resumable session location")))?;

        Ok(Box::new(ResumableWriter {
            store: self.clone(),
            id: id.clone(),
            session,
            buf: Vec::with_capacity(CHUNK_SIZE),
            offset: 0,
        }))
    }

    fn open(&self, id: &BlobId, generation: Generation) -> Result<Box<dyn Read>> {
        let what = format!("{id}@{generation}");
        let generation = generation.to_string();
        let req = self
            .client
            .get(self.object_url(id))
            .query(&[("alt", "media"), ("generation", generation.as_str())]);
        let resp = self.send(req, &what)?;
        Ok(Box::new(resp))
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut req = self
                .client
                .get(self.list_url(bucket))
                .query(&[("prefix", prefix), ("fields", "items(name,generation),nextPageToken")]);
            if let Some(token) = &page_token {
                req = req.query(&[("pageToken", token.as_str())]);
            }

            let page: ObjectList = self
                .send(req, bucket)?
                .json()
                .map_err(|e| Error::transport(format!("{bucket}: bad listing: {e}")))?;

            names.extend(page.items.into_iter().map(|o| o.name));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        names.sort();
        Ok(names)
    }
}

/// chunked upload through a resumable session
///
/// an unfinished session is never finalized and expires server side.
/// `buf` holds every byte past `offset` that the server has not yet
/// confirmed, so short acknowledgements are resent.
struct ResumableWriter {
    store: GcsStore,
    id: BlobId,
    session: String,
    buf: Vec<u8>,
    offset: u64,
}

impl ResumableWriter {
    /// send the first `len` buffered bytes, returning the raw response
    fn put_chunk(&self, len: usize, total: Option<u64>) -> Result<Response> {
        let range = content_range(self.offset, len, total);
        let req = self
            .store
            .client
            .put(&self.session)
            .header(reqwest::header::CONTENT_RANGE, range)
            .body(self.buf[..len].to_vec());
        self.store.send(req, &self.id.to_string())
    }

    /// drop the bytes the server confirmed in a 308 response
    fn advance(&mut self, resp: &Response) -> Result<u64> {
        let persisted = persisted_bytes(resp.headers().get(reqwest::header::RANGE))
            .map_err(|e| Error::transport(format!("{}: {e}", self.id)))?;
        let end = self.offset + self.buf.len() as u64;
        if persisted < self.offset || persisted > end {
            return Err(Error::transport(format!(
                "{}: server confirmed {persisted} bytes, expected {}..={end}",
                self.id, self.offset
            )));
        }
        let accepted = (persisted - self.offset) as usize;
        self.buf.drain(..accepted);
        self.offset = persisted;
        Ok(accepted as u64)
    }

    /// push one full chunk, resending whatever the server did not keep
    fn push_chunk(&mut self) -> Result<()> {
        let resp = self.put_chunk(CHUNK_SIZE, None)?;
        if resp.status() != StatusCode::PERMANENT_REDIRECT {
            return Err(Error::transport(format!(
                "{}: unexpected status {} for intermediate chunk",
                self.id,
                resp.status()
            )));
        }
        if self.advance(&resp)? == 0 {
            return Err(Error::transport(format!(
                "{}: server made no progress at offset {}",
                self.id, self.offset
            )));
        }
        Ok(())
    }
}

/// bytes persisted by the server according to a 308 `Range` header
///
/// the header reads `bytes=0-<last>`; a missing header means nothing was kept.
fn persisted_bytes(range: Option<&reqwest::header::HeaderValue>) -> std::result::Result<u64, String> {
    let Some(range) = range else {
        return Ok(0);
    };
    let text = range
        .to_str()
        .map_err(|_| "unreadable range header".to_string())?;
    let last = text
        .strip_prefix("bytes=0-")
        .and_then(|n| n.trim().parse::<u64>().ok())
        .ok_or_else(|| format!("malformed range header: {text}"))?;
    Ok(last + 1)
}

impl Write for ResumableWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        while self.buf.len() >= CHUNK_SIZE {
            self.push_chunk()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // partial chunks are only sent on finish
        Ok(())
    }
}

impl BlobWriter for ResumableWriter {
    fn finish(mut self: Box<Self>) -> Result<Generation> {
        let total = self.offset + self.buf.len() as u64;
        let what = self.id.to_string();

        loop {
            let resp = self.put_chunk(self.buf.len(), Some(total))?;
            if resp.status() == StatusCode::PERMANENT_REDIRECT {
                // the server kept only part of the tail, resend the rest
                if self.advance(&resp)? == 0 {
                    return Err(Error::transport(format!(
                        "{what}: server made no progress finalizing at offset {}",
                        self.offset
                    )));
                }
                continue;
            }

            let object: ObjectResource = resp
                .json()
                .map_err(|e| Error::transport(format!("{what}: bad upload response: {e}")))?;
            let generation = object.generation()?;
            debug!(blob = %self.id, %generation, bytes = total, "finished resumable upload");
            return Ok(generation);
        }
    }
}
