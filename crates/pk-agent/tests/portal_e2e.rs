//! End-to-end portal tests
//!
//! Runs the HTTP client and reconciler against an in-process fake portal
//! served with axum.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Form, Router};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use pk_agent::reconciler::{Credentials, Timings};
use pk_agent::{FailureCause, HttpPortalClient, ReconcileOutcome, Run, RunOutcome, SessionReconciler};
use pk_core::config::{PortalSettings, Secret};

const USER: &str = "alice";
const PASSWORD: &str = "correct horse";
const SESSION_COOKIE: &str = "pk_session=granted";

/// Knobs and request log of the fake portal
#[derive(Default)]
struct Portal {
    /// Status page always shows the account
    pre_authenticated: bool,
    /// Login page comes without credential inputs
    no_form: bool,
    /// Page returned by the login POST also shows the account
    greet_on_post: bool,
    hits: Vec<String>,
    submitted: Vec<(String, String)>,
}

type Shared = Arc<Mutex<Portal>>;

fn has_session(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(';').any(|c| c.trim() == SESSION_COOKIE))
}

async fn status(State(portal): State<Shared>, headers: HeaderMap) -> Html<String> {
    let mut portal = portal.lock().unwrap();
    portal.hits.push("GET /status".to_string());
    if portal.pre_authenticated || has_session(&headers) {
        Html(format!("<h1>Connected</h1><p>Welcome {}</p>", USER))
    } else {
        Html("<h1>Not connected</h1><a href=\"/login\">log in</a>".to_string())
    }
}

async fn logout(State(portal): State<Shared>) -> Response {
    portal.lock().unwrap().hits.push("GET /logout".to_string());
    (StatusCode::NOT_FOUND, "no such page").into_response()
}

async fn login_page(State(portal): State<Shared>) -> Html<String> {
    let mut portal = portal.lock().unwrap();
    portal.hits.push("GET /login".to_string());
    if portal.no_form {
        return Html("<p>Maintenance</p>".to_string());
    }
    Html(
        r#"<html><body>
        <form name="login" action="/login" method="post">
            <input type="hidden" name="dst" value="http://neverssl.com/">
            <input type="text" name="username" value="">
            <input type="password" name="password">
            <input type="submit" value="Connect">
        </form>
        </body></html>"#
            .to_string(),
    )
}

async fn login_submit(
    State(portal): State<Shared>,
    Form(fields): Form<Vec<(String, String)>>,
) -> Response {
    let mut portal = portal.lock().unwrap();
    portal.hits.push("POST /login".to_string());
    portal.submitted = fields.clone();

    let field = |name: &str| {
        fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    };

    if field("username") == Some(USER) && field("password") == Some(PASSWORD) {
        let body = if portal.greet_on_post {
            format!("<p>Welcome {}</p>", USER)
        } else {
            "<p>Redirecting...</p>".to_string()
        };
        (
            [(header::SET_COOKIE, format!("{}; Path=/", SESSION_COOKIE))],
            Html(body),
        )
            .into_response()
    } else {
        Html("<p>invalid username or password</p>".to_string()).into_response()
    }
}

async fn serve(portal: Portal) -> (String, Shared) {
    let shared: Shared = Arc::new(Mutex::new(portal));
    let app = Router::new()
        .route("/status", get(status))
        .route("/logout", get(logout))
        .route("/login", get(login_page).post(login_submit))
        .with_state(Arc::clone(&shared));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/", addr), shared)
}

fn fast_timings() -> Timings {
    Timings {
        page_load: Duration::from_secs(5),
        logout: Duration::from_secs(1),
        form_wait: Duration::from_secs(1),
        navigation: Duration::from_secs(2),
        settle: Duration::from_millis(50),
        recheck: Duration::from_secs(5),
    }
}

async fn reconcile(base_url: &str, password: &str) -> ReconcileOutcome {
    let client = HttpPortalClient::with_options(base_url, true, "pk-test").unwrap();
    SessionReconciler::new(
        Arc::new(client),
        Credentials {
            username: USER.to_string(),
            password: Secret::new(password),
        },
    )
    .with_timings(fast_timings())
    .run()
    .await
    .outcome
}

#[tokio::test]
async fn test_already_authenticated_skips_login() {
    let (base_url, portal) = serve(Portal {
        pre_authenticated: true,
        ..Default::default()
    })
    .await;

    assert_eq!(
        reconcile(&base_url, PASSWORD).await,
        ReconcileOutcome::AlreadyAuthenticated
    );
    assert_eq!(portal.lock().unwrap().hits, vec!["GET /status"]);
}

#[tokio::test]
async fn test_login_sets_session() {
    let (base_url, portal) = serve(Portal::default()).await;

    assert_eq!(reconcile(&base_url, PASSWORD).await, ReconcileOutcome::LoggedIn);

    let portal = portal.lock().unwrap();
    assert_eq!(
        portal.hits,
        vec![
            "GET /status",
            "GET /logout",
            "GET /login",
            "POST /login",
            "GET /status",
        ]
    );
    assert!(portal
        .submitted
        .contains(&("dst".to_string(), "http://neverssl.com/".to_string())));
}

#[tokio::test]
async fn test_login_verified_from_post_page() {
    let (base_url, portal) = serve(Portal {
        greet_on_post: true,
        ..Default::default()
    })
    .await;

    assert_eq!(reconcile(&base_url, PASSWORD).await, ReconcileOutcome::LoggedIn);
    assert_eq!(portal.lock().unwrap().hits.last().unwrap(), "POST /login");
}

#[tokio::test]
async fn test_wrong_password_is_rejected_or_unknown() {
    let (base_url, _portal) = serve(Portal::default()).await;

    assert_eq!(
        reconcile(&base_url, "wrong").await,
        ReconcileOutcome::LoginFailed(FailureCause::CredentialsRejectedOrUnknown)
    );
}

#[tokio::test]
async fn test_login_page_without_form() {
    let (base_url, portal) = serve(Portal {
        no_form: true,
        ..Default::default()
    })
    .await;

    assert_eq!(
        reconcile(&base_url, PASSWORD).await,
        ReconcileOutcome::LoginFailed(FailureCause::FormNotFound)
    );
    assert!(portal.lock().unwrap().submitted.is_empty());
}

#[tokio::test]
async fn test_unreachable_portal_releases_lock() {
    // Reserve a port, then close it so connections are refused
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = PortalSettings {
        username: Some(USER.to_string()),
        password: Some(PASSWORD.to_string()),
        base_url: Some(format!("http://{}", addr)),
        allowed_networks: Some("10.0.0.0/24".to_string()),
        ..Default::default()
    }
    .validate()
    .unwrap();

    let dir = TempDir::new().unwrap();
    let lock_path = dir.path().join(".portal-keeper.lock");
    let mut run = Run::new(&config, &lock_path);
    run.timings = fast_timings();

    let outcome = run
        .execute(
            || vec!["10.0.0.55".parse().unwrap()],
            HttpPortalClient::new,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    match outcome {
        RunOutcome::Reconciled(report) => assert_eq!(
            report.outcome,
            ReconcileOutcome::LoginFailed(FailureCause::StatusUnreachable)
        ),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(!lock_path.exists());
}

#[tokio::test]
async fn test_ineligible_address_never_contacts_portal() {
    let (base_url, portal) = serve(Portal::default()).await;
    let config = PortalSettings {
        username: Some(USER.to_string()),
        password: Some(PASSWORD.to_string()),
        base_url: Some(base_url),
        allowed_networks: Some("10.0.0.0/24".to_string()),
        ..Default::default()
    }
    .validate()
    .unwrap();

    let dir = TempDir::new().unwrap();
    let lock_path = dir.path().join(".portal-keeper.lock");

    let outcome = Run::new(&config, &lock_path)
        .execute(
            || vec!["10.0.1.1".parse().unwrap()],
            HttpPortalClient::new,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Ineligible);
    assert!(portal.lock().unwrap().hits.is_empty());
    assert!(!lock_path.exists());
}
