//! Control socket server.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Form;
use axum::extract::Query;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::info;
use tracing::warn;
use wag_reconciler::Dataplane;
use wag_reconciler::DataplaneError;
use wag_registry::Registry;
use wag_registry::RegistryError;

struct ControlState {
    registry: Arc<Registry>,
    dataplane: Arc<dyn Dataplane>,
}

/// Deadline on mutating requests. Safe-update loops are unbounded by
/// themselves; the foreground caller supplies the bound.
const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

async fn bounded<T>(work: impl Future<Output = Result<T, ControlError>>) -> Result<T, ControlError> {
    match tokio::time::timeout(REQUEST_DEADLINE, work).await {
        Ok(result) => result,
        Err(_) => Err(ControlError::Deadline),
    }
}

/// Error shape every handler funnels into.
enum ControlError {
    Registry(RegistryError),
    Dataplane(DataplaneError),
    Deadline,
}

impl From<RegistryError> for ControlError {
    fn from(err: RegistryError) -> Self {
        Self::Registry(err)
    }
}

impl From<DataplaneError> for ControlError {
    fn from(err: DataplaneError) -> Self {
        Self::Dataplane(err)
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ControlError::Registry(err) => match err {
                RegistryError::NotFound { .. } | RegistryError::NoReferenceFound { .. } => {
                    (StatusCode::NOT_FOUND, err.to_string())
                }
                RegistryError::Validation(_) | RegistryError::AlreadyExists { .. } => {
                    (StatusCode::BAD_REQUEST, err.to_string())
                }
                RegistryError::AuthDenied { .. } => (StatusCode::FORBIDDEN, err.to_string()),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            },
            ControlError::Dataplane(err) => match err {
                DataplaneError::UnknownAddress { .. } | DataplaneError::UnknownUser { .. } => {
                    (StatusCode::NOT_FOUND, format!("not found: {err}"))
                }
                DataplaneError::Failed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            },
            ControlError::Deadline => (StatusCode::GATEWAY_TIMEOUT, "request deadline exceeded".to_string()),
        };
        (status, message).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct AddressForm {
    address: String,
}

#[derive(Debug, Deserialize)]
struct UsernameForm {
    username: String,
}

#[derive(Debug, Deserialize)]
struct TokenForm {
    token: String,
}

#[derive(Debug, Default, Deserialize)]
struct UserFilter {
    username: Option<String>,
}

/// Body of `POST /tokens/add`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenRequest {
    /// Explicit token string; generated when absent.
    #[serde(default)]
    pub token: Option<String>,
    pub username: String,
    #[serde(default)]
    pub overwrites: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default = "one")]
    pub uses: u32,
}

fn one() -> u32 {
    1
}

/// The control socket server.
pub struct ControlServer {
    path: PathBuf,
}

impl ControlServer {
    /// Bind the socket (replacing any stale one), restrict it to the
    /// owner, and serve until shutdown.
    pub async fn start(
        path: &Path,
        registry: Arc<Registry>,
        dataplane: Arc<dyn Dataplane>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> std::io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
        info!(socket = %path.display(), "control socket started");

        let router = router(Arc::new(ControlState { registry, dataplane }));

        let owned = path.to_path_buf();
        tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                loop {
                    if shutdown_rx.changed().await.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }
            });
            if let Err(err) = serve.await {
                warn!(error = %err, "control socket server stopped");
            }
            let _ = std::fs::remove_file(&owned);
        });

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/device/block", post(block_device))
        .route("/device/delete", post(delete_device))
        .route("/device/sessions", get(sessions))
        .route("/device/list", get(list_devices))
        .route("/firewall/list", get(firewall_rules))
        .route("/users/list", get(list_users))
        .route("/users/delete", post(delete_user))
        .route("/users/lock", post(lock_user))
        .route("/users/unlock", post(unlock_user))
        .route("/users/reset-mfa", post(reset_user_mfa))
        .route("/tokens/list", get(list_tokens))
        .route("/tokens/add", post(add_token))
        .route("/tokens/delete", post(delete_token))
        .with_state(state)
}

async fn block_device(
    State(state): State<Arc<ControlState>>,
    Form(form): Form<AddressForm>,
) -> Result<&'static str, ControlError> {
    bounded(async {
        state.dataplane.deauthenticate(&form.address).await?;
        Ok(())
    })
    .await?;
    Ok("OK")
}

async fn delete_device(
    State(state): State<Arc<ControlState>>,
    Form(form): Form<AddressForm>,
) -> Result<&'static str, ControlError> {
    bounded(async {
        state.registry.delete_device(&form.address).await?;
        Ok(())
    })
    .await?;
    Ok("OK")
}

async fn sessions(State(state): State<Arc<ControlState>>) -> Result<Response, ControlError> {
    Ok(Json(state.dataplane.get_all_allowed().await?).into_response())
}

async fn list_devices(
    State(state): State<Arc<ControlState>>,
    Query(filter): Query<UserFilter>,
) -> Result<Response, ControlError> {
    let devices = match &filter.username {
        Some(username) => state.registry.get_devices_by_user(username).await?,
        None => state.registry.get_all_devices().await?,
    };
    Ok(Json(devices).into_response())
}

async fn firewall_rules(State(state): State<Arc<ControlState>>) -> Result<Response, ControlError> {
    Ok(Json(state.dataplane.get_rules().await?).into_response())
}

async fn list_users(
    State(state): State<Arc<ControlState>>,
    Query(filter): Query<UserFilter>,
) -> Result<Response, ControlError> {
    let users = match &filter.username {
        Some(username) => vec![state.registry.get_user(username).await?],
        None => state.registry.get_all_users().await?,
    };
    Ok(Json(users).into_response())
}

async fn delete_user(
    State(state): State<Arc<ControlState>>,
    Form(form): Form<UsernameForm>,
) -> Result<&'static str, ControlError> {
    bounded(async {
        // Resolve first so an unknown name is a 404, not a silent no-op.
        state.registry.get_user(&form.username).await?;
        state.registry.delete_user(&form.username).await?;
        Ok(())
    })
    .await?;
    Ok("OK")
}

async fn lock_user(
    State(state): State<Arc<ControlState>>,
    Form(form): Form<UsernameForm>,
) -> Result<&'static str, ControlError> {
    bounded(async {
        state.registry.set_user_lock(&form.username).await?;
        Ok(())
    })
    .await?;
    Ok("OK")
}

async fn unlock_user(
    State(state): State<Arc<ControlState>>,
    Form(form): Form<UsernameForm>,
) -> Result<&'static str, ControlError> {
    bounded(async {
        state.registry.set_user_unlock(&form.username).await?;
        Ok(())
    })
    .await?;
    Ok("OK")
}

async fn reset_user_mfa(
    State(state): State<Arc<ControlState>>,
    Form(form): Form<UsernameForm>,
) -> Result<&'static str, ControlError> {
    bounded(async {
        state.registry.reset_user_mfa(&form.username).await?;
        Ok(())
    })
    .await?;
    Ok("OK")
}

async fn list_tokens(State(state): State<Arc<ControlState>>) -> Result<Response, ControlError> {
    Ok(Json(state.registry.get_registration_tokens().await?).into_response())
}

async fn add_token(
    State(state): State<Arc<ControlState>>,
    Json(request): Json<TokenRequest>,
) -> Result<Response, ControlError> {
    let record = match &request.token {
        Some(token) => {
            state
                .registry
                .add_registration_token(token, &request.username, request.overwrites.clone(), request.groups.clone(), request.uses)
                .await?
        }
        None => {
            state
                .registry
                .generate_registration_token(&request.username, request.overwrites.clone(), request.groups.clone(), request.uses)
                .await?
        }
    };
    Ok(Json(record).into_response())
}

async fn delete_token(
    State(state): State<Arc<ControlState>>,
    Form(form): Form<TokenForm>,
) -> Result<&'static str, ControlError> {
    bounded(async {
        state.registry.get_registration_token(&form.token).await?;
        state.registry.delete_registration_token(&form.token).await?;
        Ok(())
    })
    .await?;
    Ok("OK")
}
