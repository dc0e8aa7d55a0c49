use std::{path::Path, time::Duration};

use reqwest::multipart::{Form, Part};
use reqwest_middleware::ClientWithMiddleware;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::Error;

/// Name of the multipart form field carrying the artifact.
const FORM_FIELD: &str = "UserFile";

/// The storage server confirms an accepted upload with exactly this body.
const UPLOAD_ACCEPTED: &str = "1";

/// How much of a rejecting server's response ends up in the error.
const MAX_REPORTED_BODY: usize = 120;

/// Forwards build artifacts to a remote storage server.
#[derive(Clone)]
pub struct Uploader {
    http_client: ClientWithMiddleware,
    token: Option<String>,
}

impl Uploader {
    /// Creates a new [Uploader]. Every upload, including reading the response,
    /// needs to finish within `timeout`.
    /// If `token` is set, it's sent as a bearer token.
    pub fn new(timeout: Duration, token: Option<String>) -> Result<Self, Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http_client: reqwest_middleware::ClientBuilder::new(client)
                .with(webcompile_tracing::propagate::reqwest::tracing_middleware())
                .build(),
            token,
        })
    }

    /// Uploads the artifact at `artifact_path` to `destination`.
    ///
    /// Fails with [Error::ArtifactMissing] if there's no such file, and with
    /// [Error::Upload] if the server can't be reached, times out, or doesn't
    /// confirm the upload.
    #[instrument(skip(self), err)]
    pub async fn upload(
        &self,
        artifact_path: &Path,
        destination: &str,
        session_id: &str,
        experiment_id: &str,
    ) -> Result<(), Error> {
        let url = upload_url(destination, session_id, experiment_id)?;

        let contents = tokio::fs::read(artifact_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ArtifactMissing(artifact_path.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;

        let file_name = artifact_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        debug!(url=%url, size=contents.len(), "uploading artifact");

        let part = Part::bytes(contents)
            .file_name(file_name)
            .mime_str("application/octet-stream")?;

        let mut request = self
            .http_client
            .post(url)
            .multipart(Form::new().part(FORM_FIELD, part));

        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() || body != UPLOAD_ACCEPTED {
            warn!(status=%status, body=%body, "upload rejected");
            return Err(Error::Upload(format!(
                "server responded with {}: {}",
                status,
                first_line(&body)
            )));
        }

        Ok(())
    }
}

/// The first line of a response body, cut to [MAX_REPORTED_BODY] characters.
fn first_line(body: &str) -> String {
    let line = body.trim_start().lines().next().unwrap_or_default();
    let mut summary: String = line.chars().take(MAX_REPORTED_BODY).collect();
    if summary.len() < line.len() {
        summary.push_str("...");
    }
    summary
}

/// Constructs the URL of the upload endpoint below `destination`.
fn upload_url(destination: &str, session_id: &str, experiment_id: &str) -> Result<Url, Error> {
    let mut url = Url::parse(destination)
        .map_err(|e| Error::InvalidRequest(format!("invalid upload server {destination}: {e}")))?;

    url.path_segments_mut()
        .map_err(|_| Error::InvalidRequest(format!("invalid upload server {destination}")))?
        .pop_if_empty()
        .push("index.php");

    url.query_pairs_mut()
        .clear()
        .append_pair("Function", "ServerUploadFile")
        .append_pair("ExperimentID", experiment_id)
        .append_pair("SessionID", session_id);

    Ok(url)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{collections::HashMap, net::SocketAddr, time::Duration};

    use axum::{
        extract::{Multipart, Query, State},
        http::{HeaderMap, StatusCode},
        routing::post,
        Router,
    };
    use rstest::rstest;
    use tempfile::TempDir;

    use super::{first_line, upload_url, Uploader};
    use crate::Error;

    /// Starts a storage server stand-in on localhost, answering after `delay`.
    /// It accepts a `UserFile` named `main.hex` containing `:00000001FF`.
    /// Uploads for experiment `reject` are always refused, the ones for
    /// experiment `auth` need a bearer token.
    pub(crate) async fn spawn_storage_server(delay: Duration) -> SocketAddr {
        async fn handler(
            State(delay): State<Duration>,
            Query(params): Query<HashMap<String, String>>,
            headers: HeaderMap,
            mut multipart: Multipart,
        ) -> (StatusCode, String) {
            tokio::time::sleep(delay).await;

            if params.get("Function").map(String::as_str) != Some("ServerUploadFile") {
                return (StatusCode::BAD_REQUEST, "wrong function".into());
            }
            if params.get("ExperimentID").map(String::as_str) == Some("reject") {
                return (StatusCode::OK, "0".into());
            }
            if params.get("ExperimentID").map(String::as_str) == Some("broken") {
                return (
                    StatusCode::BAD_GATEWAY,
                    "<html>\n<body>Bad Gateway</body>\n</html>\n".into(),
                );
            }
            if params.get("ExperimentID").map(String::as_str) == Some("auth")
                && headers.get("authorization").and_then(|v| v.to_str().ok())
                    != Some("Bearer s3cret")
            {
                return (StatusCode::UNAUTHORIZED, "unauthorized".into());
            }

            while let Ok(Some(field)) = multipart.next_field().await {
                if field.name() == Some("UserFile") {
                    let file_name = field.file_name().map(str::to_string);
                    let contents = field.bytes().await.unwrap_or_default();
                    if file_name.as_deref() == Some("main.hex") && &contents[..] == b":00000001FF" {
                        return (StatusCode::OK, "1".into());
                    }
                }
            }
            (StatusCode::OK, "missing file".into())
        }

        let app = Router::new()
            .route("/index.php", post(handler))
            .with_state(delay);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        addr
    }

    fn artifact() -> (TempDir, std::path::PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("main.hex");
        std::fs::write(&path, ":00000001FF").unwrap();
        (dir, path)
    }

    #[rstest]
    #[case::plain("http://upload.example", "http://upload.example/index.php?Function=ServerUploadFile&ExperimentID=69&SessionID=abc")]
    #[case::trailing_slash("http://upload.example/WIDE/", "http://upload.example/WIDE/index.php?Function=ServerUploadFile&ExperimentID=69&SessionID=abc")]
    #[case::subdir("http://upload.example/WIDE", "http://upload.example/WIDE/index.php?Function=ServerUploadFile&ExperimentID=69&SessionID=abc")]
    fn test_upload_url(#[case] destination: &str, #[case] expected: &str) {
        assert_eq!(
            expected,
            upload_url(destination, "abc", "69").expect("must succeed").as_str()
        );
    }

    #[test]
    fn upload_url_invalid() {
        assert!(matches!(
            upload_url("not a url", "abc", "69"),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn upload_accepted() {
        let addr = spawn_storage_server(Duration::ZERO).await;
        let (_dir, path) = artifact();

        Uploader::new(Duration::from_secs(5), None)
            .unwrap()
            .upload(&path, &format!("http://{addr}"), "abc", "69")
            .await
            .expect("must succeed");
    }

    #[tokio::test]
    async fn upload_with_token() {
        let addr = spawn_storage_server(Duration::ZERO).await;
        let (_dir, path) = artifact();
        let destination = format!("http://{addr}");

        Uploader::new(Duration::from_secs(5), Some("s3cret".into()))
            .unwrap()
            .upload(&path, &destination, "abc", "auth")
            .await
            .expect("must succeed");

        let err = Uploader::new(Duration::from_secs(5), None)
            .unwrap()
            .upload(&path, &destination, "abc", "auth")
            .await
            .expect_err("must fail");
        assert!(matches!(err, Error::Upload(_)));
    }

    #[tokio::test]
    async fn upload_rejected() {
        let addr = spawn_storage_server(Duration::ZERO).await;
        let (_dir, path) = artifact();

        let err = Uploader::new(Duration::from_secs(5), None)
            .unwrap()
            .upload(&path, &format!("http://{addr}"), "abc", "reject")
            .await
            .expect_err("must fail");

        assert!(matches!(err, Error::Upload(_)));
    }

    #[tokio::test]
    async fn rejection_message_is_one_line() {
        let addr = spawn_storage_server(Duration::ZERO).await;
        let (_dir, path) = artifact();

        let err = Uploader::new(Duration::from_secs(5), None)
            .unwrap()
            .upload(&path, &format!("http://{addr}"), "abc", "broken")
            .await
            .expect_err("must fail");

        assert_eq!(
            "upload failed: server responded with 502 Bad Gateway: <html>",
            err.to_string()
        );
    }

    #[rstest]
    #[case::single("0", "0")]
    #[case::multi_line("\nerror\ndetails", "error")]
    #[case::empty("", "")]
    fn test_first_line(#[case] body: &str, #[case] expected: &str) {
        assert_eq!(expected, first_line(body));
    }

    #[test]
    fn first_line_is_truncated() {
        let summary = first_line(&"x".repeat(1000));
        assert_eq!(123, summary.len());
        assert!(summary.ends_with("..."));
    }

    #[tokio::test]
    async fn upload_times_out() {
        let addr = spawn_storage_server(Duration::from_secs(10)).await;
        let (_dir, path) = artifact();

        let err = Uploader::new(Duration::from_millis(200), None)
            .unwrap()
            .upload(&path, &format!("http://{addr}"), "abc", "69")
            .await
            .expect_err("must fail");

        assert!(matches!(err, Error::Upload(_)));
    }

    #[tokio::test]
    async fn artifact_missing() {
        let dir = TempDir::new().unwrap();

        let err = Uploader::new(Duration::from_secs(5), None)
            .unwrap()
            .upload(
                &dir.path().join("main.hex"),
                "http://127.0.0.1:1",
                "abc",
                "69",
            )
            .await
            .expect_err("must fail");

        assert!(matches!(err, Error::ArtifactMissing(_)));
    }

    #[tokio::test]
    async fn server_unreachable() {
        let (_dir, path) = artifact();
        // Bind and drop a listener to get a port nobody listens on.
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();

        let err = Uploader::new(Duration::from_secs(5), None)
            .unwrap()
            .upload(&path, &format!("http://{addr}"), "abc", "69")
            .await
            .expect_err("must fail");

        assert!(matches!(err, Error::Upload(_)));
    }
}
