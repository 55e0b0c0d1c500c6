use std::sync::Arc;

use tracing::{debug, info, warn};
use upsync_dav::{DavBridge, DavResponse};

use crate::outcome::{OutcomeCode, RemoteOutcome};

/// Numbered candidates tried before giving up on a free name.
pub const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Debug, Clone)]
pub struct DestinationRequest {
    pub remote_path: String,
    pub space_id: Option<String>,
    pub overwrite: bool,
}

/// Where the file will land, and the entity tag an overwritten file must
/// still carry when the upload completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub remote_path: String,
    pub required_etag: Option<String>,
}

/// Readies the remote side before any content is sent: the parent folder
/// is created when missing, and an occupied path is either claimed for
/// overwrite or swapped for the first free numbered name.
pub struct RemoteDestination {
    bridge: Arc<dyn DavBridge>,
}

impl RemoteDestination {
    pub fn new(bridge: Arc<dyn DavBridge>) -> Self {
        Self { bridge }
    }

    pub async fn prepare(&self, request: &DestinationRequest) -> RemoteOutcome<Destination> {
        let space_id = request.space_id.as_deref();
        let ensured = self.ensure_parent(&request.remote_path, space_id).await;
        if !ensured.is_ok() {
            return ensured.cast();
        }

        let existing = match self.bridge.lookup(&request.remote_path, space_id).await {
            Ok(existing) => existing,
            Err(err) => return RemoteOutcome::from_dav_error(err),
        };
        let Some(existing) = existing else {
            return RemoteOutcome::ok(Destination {
                remote_path: request.remote_path.clone(),
                required_etag: None,
            });
        };

        if request.overwrite {
            debug!(remote_path = %request.remote_path, etag = ?existing.etag, "overwriting existing file");
            return RemoteOutcome::ok(Destination {
                remote_path: request.remote_path.clone(),
                required_etag: existing.etag,
            });
        }

        for n in 1..=MAX_NAME_ATTEMPTS {
            let candidate = numbered_path(&request.remote_path, n);
            match self.bridge.lookup(&candidate, space_id).await {
                Ok(None) => {
                    info!(from = %request.remote_path, to = %candidate, "name taken, using free name");
                    return RemoteOutcome::ok(Destination {
                        remote_path: candidate,
                        required_etag: None,
                    });
                }
                Ok(Some(_)) => {}
                Err(err) => return RemoteOutcome::from_dav_error(err),
            }
        }
        RemoteOutcome::failure(
            OutcomeCode::TargetExists,
            format!("no free name for {}", request.remote_path),
        )
    }

    async fn ensure_parent(&self, remote_path: &str, space_id: Option<&str>) -> RemoteOutcome<()> {
        let Some(parent) = parent_folder(remote_path) else {
            return RemoteOutcome::ok(());
        };
        let response = match self.bridge.create_folder(parent, space_id).await {
            Ok(response) => response,
            Err(err) => return RemoteOutcome::from_dav_error(err),
        };
        if response.status != 409 {
            return folder_outcome(response);
        }

        debug!(folder = %parent, "creating missing ancestors");
        for ancestor in ancestors(parent) {
            let created = match self.bridge.create_folder(ancestor, space_id).await {
                Ok(response) => folder_outcome(response),
                Err(err) => RemoteOutcome::from_dav_error(err),
            };
            if !created.is_ok() {
                warn!(folder = %ancestor, code = ?created.code, "cannot create folder");
                return created;
            }
        }
        RemoteOutcome::ok(())
    }
}

fn folder_outcome(response: DavResponse) -> RemoteOutcome<()> {
    match response.status {
        201 | 405 => RemoteOutcome::ok(()),
        _ => RemoteOutcome::with_code(OutcomeCode::ParentMissing, response),
    }
}

fn parent_folder(remote_path: &str) -> Option<&str> {
    let trimmed = remote_path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&trimmed[..idx]),
    }
}

/// `/a/b/c` yields `/a`, `/a/b`, `/a/b/c`.
fn ancestors(folder: &str) -> impl Iterator<Item = &str> {
    folder
        .match_indices('/')
        .map(|(idx, _)| idx)
        .filter(|&idx| idx > 0)
        .map(move |idx| &folder[..idx])
        .chain(std::iter::once(folder))
}

/// `/Docs/report.pdf` with `n = 2` becomes `/Docs/report (2).pdf`; a name
/// without extension gets the suffix at its end.
pub fn numbered_path(remote_path: &str, n: u32) -> String {
    let name_start = remote_path.rfind('/').map_or(0, |idx| idx + 1);
    match remote_path[name_start..].rfind('.') {
        Some(dot) if dot > 0 => {
            let dot = name_start + dot;
            format!("{} ({n}){}", &remote_path[..dot], &remote_path[dot..])
        }
        _ => format!("{remote_path} ({n})"),
    }
}

#[cfg(test)]
mod tests {
    use upsync_dav::{DavMethod, InMemoryDavBridge};

    use super::*;

    fn request(remote_path: &str, overwrite: bool) -> DestinationRequest {
        DestinationRequest {
            remote_path: remote_path.into(),
            space_id: None,
            overwrite,
        }
    }

    #[test]
    fn numbered_names_keep_the_extension() {
        assert_eq!(numbered_path("/Docs/report.pdf", 1), "/Docs/report (1).pdf");
        assert_eq!(numbered_path("/Docs/archive.tar.gz", 2), "/Docs/archive.tar (2).gz");
        assert_eq!(numbered_path("/Docs/README", 1), "/Docs/README (1)");
        assert_eq!(numbered_path("/Docs/.profile", 1), "/Docs/.profile (1)");
        assert_eq!(numbered_path("/v1.2/notes", 3), "/v1.2/notes (3)");
        assert_eq!(numbered_path("/Docs/copy (1).jpg", 1), "/Docs/copy (1) (1).jpg");
    }

    #[test]
    fn ancestors_run_top_down() {
        let folders: Vec<_> = ancestors("/a/b/c").collect();
        assert_eq!(folders, ["/a", "/a/b", "/a/b/c"]);
        assert_eq!(parent_folder("/top.txt"), None);
        assert_eq!(parent_folder("/a/b/c.txt"), Some("/a/b"));
    }

    #[tokio::test]
    async fn free_path_is_kept() {
        let server = Arc::new(InMemoryDavBridge::new());
        server.mkdir_all("/Docs");

        let outcome = RemoteDestination::new(server.clone())
            .prepare(&request("/Docs/a.txt", false))
            .await;

        assert_eq!(
            outcome.data,
            Some(Destination {
                remote_path: "/Docs/a.txt".into(),
                required_etag: None,
            })
        );
    }

    #[tokio::test]
    async fn missing_folders_are_created() {
        let server = Arc::new(InMemoryDavBridge::new());
        server.mkdir_all("/Photos");

        let outcome = RemoteDestination::new(server.clone())
            .prepare(&request("/Photos/2024/June/img.jpg", false))
            .await;

        assert!(outcome.is_ok(), "{outcome:?}");
        assert!(server.has_folder("/Photos/2024/June"));
        let mkcols: Vec<_> = server
            .requests()
            .into_iter()
            .filter(|r| r.method == DavMethod::Mkcol)
            .map(|r| r.target)
            .collect();
        assert_eq!(
            mkcols,
            ["/Photos/2024/June", "/Photos", "/Photos/2024", "/Photos/2024/June"]
        );
    }

    #[tokio::test]
    async fn occupied_path_moves_to_first_free_number() {
        let server = Arc::new(InMemoryDavBridge::new());
        server.seed_file("/Docs/a.txt", b"one");
        server.seed_file("/Docs/a (1).txt", b"two");

        let outcome = RemoteDestination::new(server.clone())
            .prepare(&request("/Docs/a.txt", false))
            .await;

        assert_eq!(
            outcome.data.map(|d| d.remote_path),
            Some("/Docs/a (2).txt".to_string())
        );
    }

    #[tokio::test]
    async fn overwrite_pins_the_current_etag() {
        let server = Arc::new(InMemoryDavBridge::new());
        server.seed_file("/Docs/a.txt", b"one");

        let outcome = RemoteDestination::new(server.clone())
            .prepare(&request("/Docs/a.txt", true))
            .await;

        let destination = outcome.data.expect("destination");
        assert_eq!(destination.remote_path, "/Docs/a.txt");
        assert_eq!(destination.required_etag, server.file_etag("/Docs/a.txt"));
        assert!(destination.required_etag.is_some());
    }

    #[tokio::test]
    async fn refused_folder_is_a_folder_failure() {
        let server = Arc::new(InMemoryDavBridge::new());
        server.respond_next(DavMethod::Mkcol, 403);

        let outcome = RemoteDestination::new(server.clone())
            .prepare(&request("/Locked/a.txt", false))
            .await;

        assert_eq!(outcome.code, OutcomeCode::ParentMissing);
        assert_eq!(outcome.http.map(|h| h.status), Some(403));
    }

    #[tokio::test]
    async fn unreachable_server_is_reported() {
        let server = Arc::new(InMemoryDavBridge::new());
        server.set_offline(true);

        let outcome = RemoteDestination::new(server)
            .prepare(&request("/Docs/a.txt", false))
            .await;

        assert_eq!(outcome.code, OutcomeCode::NetworkUnreachable);
    }
}
