//! Typed folder, file and user operations.

use std::path::Path;

use chrono::{DateTime, Utc};
use kitebroker_api::paging::DEFAULT_DATA_LIMIT;
use kitebroker_api::{ApiRequest, Download, DownloadPart, Error, Session, UploadSpec};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::models::{Entry, EntryKind, File, Folder, Listing, User};

/// Children of a folder, split by kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FolderContents {
    pub folders: Vec<Folder>,
    pub files: Vec<File>,
}

/// kiteworks operations acting as one user.
#[derive(Debug, Clone)]
pub struct Kiteworks {
    session: Session,
}

impl Kiteworks {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn username(&self) -> &str {
        self.session.username()
    }

    /// All pages of a `data` listing.
    async fn list<T: DeserializeOwned>(&self, req: ApiRequest) -> Result<Vec<T>, Error> {
        self.session.data_call(req, -1, DEFAULT_DATA_LIMIT).await
    }

    // ── Users ──────────────────────────────────────────────────────────

    pub async fn my_user(&self) -> Result<User, Error> {
        self.session.call(ApiRequest::get("/rest/users/me")).await
    }

    /// Looks a user up by email; `None` if the server knows no such user.
    pub async fn find_user(&self, email: &str) -> Result<Option<User>, Error> {
        let users: Vec<User> = self
            .list(ApiRequest::get("/rest/users").query([("email", email)]))
            .await?;
        Ok(users
            .into_iter()
            .find(|u| u.email.eq_ignore_ascii_case(email)))
    }

    pub async fn users(&self) -> Result<Vec<User>, Error> {
        self.list(ApiRequest::get("/rest/users")).await
    }

    /// One page of users with the server's totals.
    pub async fn users_page(&self, offset: u64, limit: u64) -> Result<Listing<User>, Error> {
        self.session
            .call(
                ApiRequest::get("/rest/users")
                    .query([("offset", offset.to_string()), ("limit", limit.to_string())]),
            )
            .await
    }

    // ── Folders ────────────────────────────────────────────────────────

    pub async fn top_folders(&self) -> Result<Vec<Folder>, Error> {
        self.list(ApiRequest::get("/rest/folders/top")).await
    }

    pub async fn folder(&self, id: &str) -> Result<Folder, Error> {
        self.session.call(ApiRequest::get(format!("/rest/folders/{id}"))).await
    }

    /// Direct subfolders.
    pub async fn folder_children(&self, id: &str) -> Result<Vec<Folder>, Error> {
        self.list(ApiRequest::get(format!("/rest/folders/{id}/folders")))
            .await
    }

    pub async fn folder_files(&self, id: &str) -> Result<Vec<File>, Error> {
        self.list(ApiRequest::get(format!("/rest/folders/{id}/files")))
            .await
    }

    /// Folders and files in a single listing.
    pub async fn folder_contents(&self, id: &str) -> Result<FolderContents, Error> {
        let entries: Vec<Value> = self
            .list(ApiRequest::get(format!("/rest/folders/{id}/children")))
            .await?;
        let mut contents = FolderContents::default();
        for value in entries {
            let entry: Entry = serde_json::from_value(value.clone())?;
            match entry.kind {
                EntryKind::Folder => contents.folders.push(serde_json::from_value(value)?),
                EntryKind::File => contents.files.push(serde_json::from_value(value)?),
            }
        }
        Ok(contents)
    }

    pub async fn create_folder(&self, parent_id: &str, name: &str, description: &str) -> Result<Folder, Error> {
        let folder: Folder = self
            .session
            .call(
                ApiRequest::post(format!("/rest/folders/{parent_id}/folders"))
                    .query([("returnEntity", "true")])
                    .json(json!({ "name": name, "description": description })),
            )
            .await?;
        info!(user = self.username(), parent = parent_id, folder = %folder.id, name, "folder created");
        Ok(folder)
    }

    pub async fn delete_folder(&self, id: &str) -> Result<(), Error> {
        let _: Value = self
            .session
            .call(ApiRequest::delete(format!("/rest/folders/{id}")))
            .await?;
        debug!(user = self.username(), folder = id, "folder deleted");
        Ok(())
    }

    // ── Files ──────────────────────────────────────────────────────────

    pub async fn file(&self, id: &str) -> Result<File, Error> {
        self.session.call(ApiRequest::get(format!("/rest/files/{id}"))).await
    }

    pub async fn delete_file(&self, id: &str) -> Result<(), Error> {
        let _: Value = self
            .session
            .call(ApiRequest::delete(format!("/rest/files/{id}")))
            .await?;
        debug!(user = self.username(), file = id, "file deleted");
        Ok(())
    }

    /// Uploads a local file into a folder.
    ///
    /// With `resume`, an interrupted upload of the same file (same name, size
    /// and mtime into the same folder) continues where it stopped.
    pub async fn upload_file(&self, folder_id: &str, path: &Path, resume: bool) -> Result<File, Error> {
        let initiate = ApiRequest::post(format!("/rest/folders/{folder_id}/actions/initiateUpload"));
        self.upload_path(initiate, folder_id.to_string(), path, resume).await
    }

    /// Uploads a local file as a new version of an existing file.
    pub async fn upload_version(&self, file_id: &str, path: &Path, resume: bool) -> Result<File, Error> {
        let initiate = ApiRequest::post(format!("/rest/files/{file_id}/actions/initiateUpload"));
        self.upload_path(initiate, format!("file:{file_id}"), path, resume).await
    }

    async fn upload_path(&self, initiate: ApiRequest, dest: String, path: &Path, resume: bool) -> Result<File, Error> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Request(format!("not a file path: {}", path.display())))?;
        let mut source = tokio::fs::File::open(path).await?;
        let meta = source.metadata().await?;
        let modified: DateTime<Utc> = meta.modified()?.into();
        let spec = UploadSpec {
            dest,
            filename,
            size: meta.len(),
            modified,
        };
        self.session.upload(initiate, &spec, &mut source, resume).await
    }

    /// Opens the content of a file for reading.
    pub async fn open_file(&self, file: &File) -> Result<Download, Error> {
        let part = DownloadPart::new(
            ApiRequest::get(format!("/rest/files/{}/content", file.id)),
            Some(file.size),
        );
        self.session.download(vec![part]).await
    }

    /// Downloads a file to `dest`, returning the bytes written.
    ///
    /// A shorter existing file at `dest` is treated as a partial download and
    /// continued with a ranged request; a complete one is left untouched.
    pub async fn download_file(&self, file: &File, dest: &Path) -> Result<u64, Error> {
        let existing = match tokio::fs::metadata(dest).await {
            Ok(meta) => Some(meta.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        if existing == Some(file.size) {
            debug!(user = self.username(), file = %file.id, "already downloaded");
            return Ok(0);
        }
        // Longer than the server's copy: start over.
        let offset = existing.filter(|&len| len < file.size).unwrap_or(0);

        let mut download = self.open_file(file).await?;
        let mut out = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(offset > 0)
            .truncate(offset == 0)
            .open(dest)
            .await?;
        if offset > 0 {
            download.seek(offset as i64, 0)?;
        }
        let written = download.copy_to(&mut out).await?;
        out.flush().await?;
        download.close();
        info!(user = self.username(), file = %file.id, bytes = written, resumed_at = offset, "download complete");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kitebroker_api::testing::{self, MockTransport, Recorded, Reply, USER};
    use serde_json::json;

    use super::*;
    use crate::KiteworksErrorScanner;

    /// Answers from `handler`, checking every request carries the user's token.
    fn serve<F>(handler: F) -> Arc<MockTransport>
    where
        F: Fn(&Recorded) -> Reply + Send + Sync + 'static,
    {
        MockTransport::new(move |req| {
            assert_eq!(req.header("authorization").as_deref(), Some("Bearer valid-token"));
            Ok(handler(req))
        })
    }

    fn kiteworks(mock: &Arc<MockTransport>) -> Kiteworks {
        let client = testing::builder(testing::config(), Arc::clone(mock))
            .error_scanner(Arc::new(KiteworksErrorScanner))
            .build()
            .unwrap();
        Kiteworks::new(client.session(USER))
    }

    fn page(items: Vec<Value>) -> Reply {
        Reply::json(200, json!({ "data": items, "metadata": {"total": 0} }))
    }

    #[tokio::test]
    async fn my_user() {
        let stub = serve(|req| {
            assert_eq!(req.path(), "/rest/users/me");
            Reply::json(200, json!({"id": 5, "email": "alice@example.com", "name": "Alice"}))
        });
        let user = kiteworks(&stub).my_user().await.unwrap();
        assert_eq!(user.id, "5");
        assert_eq!(user.name, "Alice");
    }

    #[tokio::test]
    async fn find_user_matches_email() {
        let stub = serve(|req| {
            assert_eq!(req.query("email").as_deref(), Some("Bob@example.com"));
            page(vec![json!({"id": "u2", "email": "bob@example.com"})])
        });
        let kw = kiteworks(&stub);
        assert_eq!(kw.find_user("Bob@example.com").await.unwrap().unwrap().id, "u2");

        let empty = serve(|_| page(vec![]));
        assert!(kiteworks(&empty).find_user("x@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn top_folders_follow_pages() {
        let stub = serve(|req| {
            let offset: usize = req.query("offset").unwrap().parse().unwrap();
            let items = if offset == 0 { 1000 } else { 3 };
            page(
                (0..items)
                    .map(|i| json!({"id": format!("d{}", offset + i), "name": "x", "type": "d"}))
                    .collect(),
            )
        });
        let folders = kiteworks(&stub).top_folders().await.unwrap();
        assert_eq!(folders.len(), 1003);
        assert_eq!(folders[1002].id, "d1002");
        assert_eq!(stub.count(), 2);
    }

    #[tokio::test]
    async fn folder_contents_split_by_kind() {
        let stub = serve(|req| {
            assert_eq!(req.path(), "/rest/folders/d1/children");
            page(vec![
                json!({"id": "d2", "name": "sub", "type": "d"}),
                json!({"id": "f1", "name": "a.txt", "type": "f", "size": 3}),
                json!({"id": "f2", "name": "b.txt", "type": "f", "size": 4}),
            ])
        });
        let contents = kiteworks(&stub).folder_contents("d1").await.unwrap();
        assert_eq!(contents.folders.len(), 1);
        assert_eq!(contents.files.iter().map(|f| f.size).sum::<u64>(), 7);
    }

    #[tokio::test]
    async fn create_and_delete_folder() {
        let stub = serve(|req| match req.method.as_str() {
            "POST" => {
                assert_eq!(req.path(), "/rest/folders/d1/folders");
                assert_eq!(req.query("returnEntity").as_deref(), Some("true"));
                let body: Value = serde_json::from_slice(&req.body).unwrap();
                let name = body["name"].clone();
                Reply::json(201, json!({"id": "d9", "name": name, "parentId": "d1"}))
            }
            "DELETE" => {
                assert_eq!(req.path(), "/rest/folders/d9");
                Reply::empty(204)
            }
            other => panic!("unexpected {other}"),
        });
        let kw = kiteworks(&stub);
        let folder = kw.create_folder("d1", "Reports", "").await.unwrap();
        assert_eq!((folder.id.as_str(), folder.name.as_str()), ("d9", "Reports"));
        kw.delete_folder(&folder.id).await.unwrap();
    }

    #[tokio::test]
    async fn server_errors_are_structured() {
        let stub = serve(|_| {
            Reply::json(
                403,
                json!({"errors": [{"code": "ERR_ACCESS_USER", "message": "denied"}]}),
            )
        });
        let err = kiteworks(&stub).file("f1").await.unwrap_err();
        assert!(err.has_code(&["ERR_ACCESS_USER"]));
        assert_eq!(stub.count(), 1);
    }

    #[tokio::test]
    async fn upload_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello kiteworks").unwrap();

        let stub = serve(|req| {
            if req.path().ends_with("/initiateUpload") {
                assert_eq!(req.path(), "/rest/folders/d1/actions/initiateUpload");
                let body: Value = serde_json::from_slice(&req.body).unwrap();
                assert_eq!(body["filename"], "notes.txt");
                assert_eq!(body["totalSize"], 15);
                return Reply::json(200, json!({"id": "up-1", "totalChunks": 1}));
            }
            assert_eq!(req.path(), "/rest/uploads/up-1");
            assert!(String::from_utf8_lossy(&req.body).contains("hello kiteworks"));
            Reply::json(200, json!({"id": "f7", "name": "notes.txt", "size": 15}))
        });
        let file = kiteworks(&stub).upload_file("d1", &path, true).await.unwrap();
        assert_eq!(file.id, "f7");
        assert_eq!(stub.count(), 2);
    }

    #[tokio::test]
    async fn upload_version_targets_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v2.bin");
        std::fs::write(&path, [1u8; 8]).unwrap();

        let stub = serve(|req| {
            if req.path().ends_with("/initiateUpload") {
                assert_eq!(req.path(), "/rest/files/f7/actions/initiateUpload");
                return Reply::json(200, json!({"id": 12, "uri": "rest/uploads/12"}));
            }
            assert_eq!(req.path(), "/rest/uploads/12");
            Reply::json(200, json!({"id": "f7", "name": "v2.bin", "size": 8}))
        });
        let file = kiteworks(&stub).upload_version("f7", &path, false).await.unwrap();
        assert_eq!(file.size, 8);
    }

    fn remote_file(size: u64) -> File {
        serde_json::from_value(json!({"id": "f1", "name": "data.bin", "size": size})).unwrap()
    }

    #[tokio::test]
    async fn download_file_writes_content() {
        let stub = serve(|req| {
            assert_eq!(req.path(), "/rest/files/f1/content");
            assert!(req.header("range").is_none());
            Reply::bytes(200, b"0123456789".to_vec())
        });
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("data.bin");
        let written = kiteworks(&stub).download_file(&remote_file(10), &dest).await.unwrap();
        assert_eq!(written, 10);
        assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn download_file_continues_a_partial_copy() {
        let stub = serve(|req| {
            assert_eq!(req.header("range").as_deref(), Some("bytes=4-"));
            Reply::bytes(206, b"456789".to_vec()).header("content-range", "bytes 4-9/10")
        });
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("data.bin");
        std::fs::write(&dest, b"0123").unwrap();

        let kw = kiteworks(&stub);
        assert_eq!(kw.download_file(&remote_file(10), &dest).await.unwrap(), 6);
        assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");

        // Complete: nothing is fetched.
        assert_eq!(kw.download_file(&remote_file(10), &dest).await.unwrap(), 0);
        assert_eq!(stub.count(), 1);
    }
}
