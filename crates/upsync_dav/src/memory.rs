use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::bridge::{
    ChunkPut, DavBridge, DavError, DavMethod, DavResponse, FilePut, NamespaceMove, RemoteFile,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: DavMethod,
    pub target: String,
    pub body_len: usize,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredFile {
    data: Vec<u8>,
    mtime_secs: i64,
    etag: String,
}

#[derive(Debug, Default)]
struct ServerState {
    namespaces: HashMap<String, BTreeMap<u64, Vec<u8>>>,
    files: HashMap<String, StoredFile>,
    folders: BTreeSet<String>,
    requests: Vec<RecordedRequest>,
    scripted: VecDeque<(DavMethod, u16)>,
    offline: bool,
    revision: u64,
}

/// Chunking server kept in memory.
///
/// Follows the status codes of a WebDAV chunking endpoint: MOVE onto an
/// existing file without overwrite yields 412, onto a missing parent 409.
/// MKCOL on an existing resource yields 405.
#[derive(Debug, Default)]
pub struct InMemoryDavBridge {
    state: Mutex<ServerState>,
}

impl InMemoryDavBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mkdir_all(&self, path: &str) {
        let mut state = self.lock();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            state.folders.insert(current.clone());
        }
    }

    pub fn seed_file(&self, path: &str, data: &[u8]) {
        let path = normalize(path);
        if let Some(parent) = parent_of(&path) {
            self.mkdir_all(&parent);
        }
        let mut state = self.lock();
        state.revision += 1;
        let etag = format!("etag-{}", state.revision);
        state.files.insert(
            path,
            StoredFile {
                data: data.to_vec(),
                mtime_secs: 0,
                etag,
            },
        );
    }

    pub fn remove_folder(&self, path: &str) {
        let path = normalize(path);
        let mut state = self.lock();
        state
            .folders
            .retain(|folder| folder != &path && !folder.starts_with(&format!("{path}/")));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(&normalize(path)).map(|f| f.data.clone())
    }

    pub fn file_etag(&self, path: &str) -> Option<String> {
        self.lock().files.get(&normalize(path)).map(|f| f.etag.clone())
    }

    pub fn has_folder(&self, path: &str) -> bool {
        self.lock().folders.contains(&normalize(path))
    }

    pub fn file_mtime(&self, path: &str) -> Option<i64> {
        self.lock().files.get(&normalize(path)).map(|f| f.mtime_secs)
    }

    pub fn namespace_chunks(&self, transfer_id: &str) -> Option<Vec<u64>> {
        self.lock()
            .namespaces
            .get(transfer_id)
            .map(|chunks| chunks.keys().copied().collect())
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    /// The next request with `method` answers `status` without side effects.
    pub fn respond_next(&self, method: DavMethod, status: u16) {
        self.lock().scripted.push_back((method, status));
    }

    /// While offline every request fails before reaching the server.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ServerState {
    fn begin(
        &mut self,
        method: DavMethod,
        target: &str,
        body_len: usize,
        timeout: Option<Duration>,
    ) -> Result<Option<DavResponse>, DavError> {
        if self.offline {
            return Err(DavError::Connection(format!("{method} {target}: network unreachable")));
        }
        self.requests.push(RecordedRequest {
            method,
            target: target.to_string(),
            body_len,
            timeout,
        });
        let scripted = self
            .scripted
            .iter()
            .position(|(m, _)| *m == method)
            .and_then(|pos| self.scripted.remove(pos));
        Ok(scripted.map(|(_, status)| respond(method, target, status)))
    }

    fn parent_exists(&self, path: &str) -> bool {
        match parent_of(path) {
            None => true,
            Some(parent) => self.folders.contains(&parent),
        }
    }

    fn store(&mut self, path: String, data: Vec<u8>, mtime_secs: i64) -> (u16, String) {
        self.revision += 1;
        let etag = format!("etag-{}", self.revision);
        let status = if self.files.contains_key(&path) { 204 } else { 201 };
        self.files.insert(
            path,
            StoredFile {
                data,
                mtime_secs,
                etag: etag.clone(),
            },
        );
        (status, etag)
    }
}

fn respond(method: DavMethod, target: &str, status: u16) -> DavResponse {
    DavResponse {
        method,
        target: target.to_string(),
        status,
        etag: None,
    }
}

fn normalize(path: &str) -> String {
    let joined: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", joined.join("/"))
}

fn parent_of(path: &str) -> Option<String> {
    let path = normalize(path);
    match path.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(path[..idx].to_string()),
    }
}

#[async_trait]
impl DavBridge for InMemoryDavBridge {
    async fn create_namespace(&self, transfer_id: &str) -> Result<DavResponse, DavError> {
        let target = format!("uploads/{transfer_id}");
        let mut state = self.lock();
        if let Some(scripted) = state.begin(DavMethod::Mkcol, &target, 0, None)? {
            return Ok(scripted);
        }
        if state.namespaces.contains_key(transfer_id) {
            return Ok(respond(DavMethod::Mkcol, &target, 405));
        }
        state.namespaces.insert(transfer_id.to_string(), BTreeMap::new());
        Ok(respond(DavMethod::Mkcol, &target, 201))
    }

    async fn put_chunk(&self, request: ChunkPut) -> Result<DavResponse, DavError> {
        let target = format!("uploads/{}/{}", request.transfer_id, request.index);
        let mut state = self.lock();
        if let Some(scripted) =
            state.begin(DavMethod::Put, &target, request.body.len(), Some(request.timeout))?
        {
            return Ok(scripted);
        }
        match state.namespaces.get_mut(&request.transfer_id) {
            Some(chunks) => {
                chunks.insert(request.index, request.body);
                Ok(respond(DavMethod::Put, &target, 201))
            }
            None => Ok(respond(DavMethod::Put, &target, 404)),
        }
    }

    async fn move_namespace(&self, request: NamespaceMove) -> Result<DavResponse, DavError> {
        let target = format!("uploads/{}", request.transfer_id);
        let destination = normalize(&request.destination);
        let mut state = self.lock();
        if let Some(scripted) = state.begin(DavMethod::Move, &target, 0, Some(request.timeout))? {
            return Ok(scripted);
        }
        if !state.namespaces.contains_key(&request.transfer_id) {
            return Ok(respond(DavMethod::Move, &target, 404));
        }
        if !state.parent_exists(&destination) {
            return Ok(respond(DavMethod::Move, &target, 409));
        }
        if let Some(existing) = state.files.get(&destination) {
            if !request.overwrite {
                return Ok(respond(DavMethod::Move, &target, 412));
            }
            if let Some(expected) = &request.if_match {
                if expected != &existing.etag {
                    return Ok(respond(DavMethod::Move, &target, 412));
                }
            }
        }
        let assembled: Vec<u8> = state
            .namespaces
            .get(&request.transfer_id)
            .map(|chunks| chunks.values().flatten().copied().collect())
            .unwrap_or_default();
        if assembled.len() as u64 != request.total_length {
            return Ok(respond(DavMethod::Move, &target, 400));
        }
        state.namespaces.remove(&request.transfer_id);
        let (status, etag) = state.store(destination.clone(), assembled, request.mtime_secs);
        info!(destination = %destination, "assembled chunk namespace");
        Ok(DavResponse {
            method: DavMethod::Move,
            target,
            status,
            etag: Some(etag),
        })
    }

    async fn delete_namespace(&self, transfer_id: &str) -> Result<DavResponse, DavError> {
        let target = format!("uploads/{transfer_id}");
        let mut state = self.lock();
        if let Some(scripted) = state.begin(DavMethod::Delete, &target, 0, None)? {
            return Ok(scripted);
        }
        let status = match state.namespaces.remove(transfer_id) {
            Some(_) => 204,
            None => 404,
        };
        Ok(respond(DavMethod::Delete, &target, status))
    }

    async fn put_file(&self, request: FilePut) -> Result<DavResponse, DavError> {
        let path = normalize(&request.remote_path);
        let mut state = self.lock();
        if let Some(scripted) =
            state.begin(DavMethod::Put, &path, request.body.len(), Some(request.timeout))?
        {
            return Ok(scripted);
        }
        if !state.parent_exists(&path) {
            return Ok(respond(DavMethod::Put, &path, 409));
        }
        if let Some(existing) = state.files.get(&path) {
            let stale = request
                .if_match
                .as_ref()
                .is_some_and(|expected| expected != &existing.etag);
            if request.create_only || stale {
                return Ok(respond(DavMethod::Put, &path, 412));
            }
        }
        let (status, etag) = state.store(path.clone(), request.body, request.mtime_secs);
        Ok(DavResponse {
            method: DavMethod::Put,
            target: path,
            status,
            etag: Some(etag),
        })
    }

    async fn create_folder(
        &self,
        remote_path: &str,
        _space_id: Option<&str>,
    ) -> Result<DavResponse, DavError> {
        let path = normalize(remote_path);
        let mut state = self.lock();
        if let Some(scripted) = state.begin(DavMethod::Mkcol, &path, 0, None)? {
            return Ok(scripted);
        }
        let status = if path == "/" || state.folders.contains(&path) || state.files.contains_key(&path)
        {
            405
        } else if !state.parent_exists(&path) {
            409
        } else {
            state.folders.insert(path.clone());
            201
        };
        Ok(respond(DavMethod::Mkcol, &path, status))
    }

    async fn lookup(
        &self,
        remote_path: &str,
        _space_id: Option<&str>,
    ) -> Result<Option<RemoteFile>, DavError> {
        let path = normalize(remote_path);
        let mut state = self.lock();
        if let Some(scripted) = state.begin(DavMethod::Head, &path, 0, None)? {
            return match scripted.status {
                404 => Ok(None),
                status => Err(DavError::Request(format!("HEAD {path} returned {status}"))),
            };
        }
        Ok(state.files.get(&path).map(|f| RemoteFile {
            length: f.data.len() as u64,
            etag: Some(f.etag.clone()),
        }))
    }
}
