//! Service exposure and connect refusals.

use std::time::Duration;

use w3nrpc::CloseReason;
use w3nrpc::ExceptionKind;

use w3nrun::Envelope;
use w3nrun::Error;
use w3nrun::Platform;
use w3nrun::Router;
use w3nrun::config::AppManifest;
use w3nrun::config::ServiceAccess;

fn platform() -> Platform {
    Platform::builder()
        .app(AppManifest::new("app.files")
            .service("public", ServiceAccess::any_app())
            .service("private", ServiceAccess::this_app())
            .service("partners", ServiceAccess::apps(["app.friend"])))
        .app(AppManifest::new("app.friend"))
        .app(AppManifest::new("app.stranger"))
        .build()
}

#[tokio::test]
async fn test_second_expose_is_refused_until_withdrawn() {
    let platform = platform();
    let files = platform.registry("app.files", None).unwrap();

    let first = files.expose_service("public").unwrap();
    let exc = files.expose_service("public").unwrap_err();
    assert_eq!(exc.kind, ExceptionKind::ServiceAlreadyExposed);
    assert_eq!(exc.app_domain, "app.files");
    assert_eq!(exc.service, "public");

    first.unsubscribe();
    let again = files.expose_service("public").unwrap();
    drop(again);
    assert!(files.expose_service("public").is_ok());
}

#[tokio::test]
async fn test_expose_undeclared_service() {
    let platform = platform();
    let files = platform.registry("app.files", None).unwrap();

    let exc = files.expose_service("secret").unwrap_err();
    assert_eq!(exc.kind, ExceptionKind::ServiceNotFound);
}

#[tokio::test]
async fn test_unknown_app_has_no_registry() {
    let platform = platform();
    let err = platform.registry("app.ghost", None).unwrap_err();
    assert_eq!(err, Error::UnknownApp("app.ghost".into()));
}

#[tokio::test]
async fn test_caller_policies() {
    let platform = platform();
    let files = platform.registry("app.files", Some("server")).unwrap();
    let friend = platform.registry("app.friend", None).unwrap();
    let stranger = platform.registry("app.stranger", Some("ui")).unwrap();

    let _public = files.expose_service("public").unwrap();
    let _private = files.expose_service("private").unwrap();
    let _partners = files.expose_service("partners").unwrap();

    assert!(stranger.other_app("app.files", "public").await.is_ok());
    assert!(files.this_app("private").await.is_ok());
    assert!(friend.other_app("app.files", "partners").await.is_ok());

    let exc = stranger.other_app("app.files", "private").await.unwrap_err();
    assert_eq!(exc.kind, ExceptionKind::CallerNotAllowed);
    assert_eq!(exc.service, "private");
    assert_eq!(exc.caller_app.as_deref(), Some("app.stranger"));
    assert_eq!(exc.caller_component.as_deref(), Some("ui"));

    let exc = stranger.other_app("app.files", "partners").await.unwrap_err();
    assert_eq!(exc.kind, ExceptionKind::CallerNotAllowed);
}

#[tokio::test]
async fn test_service_not_found() {
    let platform = platform();
    let friend = platform.registry("app.friend", None).unwrap();

    // Declared but not exposed.
    let exc = friend.other_app("app.files", "public").await.unwrap_err();
    assert_eq!(exc.kind, ExceptionKind::ServiceNotFound);

    let exc = friend.other_app("app.files", "nope").await.unwrap_err();
    assert_eq!(exc.kind, ExceptionKind::ServiceNotFound);

    let exc = friend.other_app("app.ghost", "public").await.unwrap_err();
    assert_eq!(exc.kind, ExceptionKind::ServiceNotFound);
    assert_eq!(exc.app_domain, "app.ghost");
}

#[tokio::test]
async fn test_stopped_listener_refuses_connections() {
    let platform = platform();
    let files = platform.registry("app.files", None).unwrap();
    let friend = platform.registry("app.friend", None).unwrap();

    let mut listener = files.expose_service("public").unwrap();
    listener.stop_accepting();

    let exc = friend.other_app("app.files", "public").await.unwrap_err();
    assert_eq!(exc.kind, ExceptionKind::ConnectionNotAccepted);

    // The name stays taken.
    let exc = files.expose_service("public").unwrap_err();
    assert_eq!(exc.kind, ExceptionKind::ServiceAlreadyExposed);
}

#[tokio::test]
async fn test_listener_delivers_caller_identity() {
    let platform = platform();
    let files = platform.registry("app.files", None).unwrap();
    let friend = platform.registry("app.friend", Some("worker")).unwrap();

    let mut listener = files.expose_service("partners").unwrap();
    let _conn = friend.other_app("app.files", "partners").await.unwrap();

    let incoming = listener.next().await.unwrap().unwrap();
    assert_eq!(incoming.service(), "partners");
    assert_eq!(incoming.caller_app(), Some("app.friend"));
    assert_eq!(incoming.caller_component(), Some("worker"));
}

#[tokio::test]
async fn test_abort_reports_listener_error() {
    let platform = platform();
    let files = platform.registry("app.files", None).unwrap();

    let mut listener = files.expose_service("public").unwrap();
    files.abort();

    let exc = listener.next().await.unwrap().unwrap_err();
    assert_eq!(exc.kind, ExceptionKind::ConnectionClosed(CloseReason::TransportFailure));
    assert!(listener.next().await.is_none());

    // Withdrawn, so it can be exposed again.
    assert!(files.expose_service("public").is_ok());
}

#[tokio::test]
async fn test_platform_shutdown_completes_listeners() {
    let platform = platform();
    let files = platform.registry("app.files", None).unwrap();

    let mut listener = files.expose_service("public").unwrap();
    platform.shutdown();

    let next = tokio::time::timeout(Duration::from_secs(1), listener.next()).await.unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn test_served_connection_round_trip() {
    let platform = platform();
    let files = platform.registry("app.files", None).unwrap();
    let stranger = platform.registry("app.stranger", None).unwrap();

    let mut listener = files.expose_service("public").unwrap();
    let router = Router::new().reply("greet", |args: Option<Envelope>| async move {
        let name = args.and_then(|a| a.bytes).unwrap_or_default();
        let mut reply = b"hello ".to_vec();
        reply.extend_from_slice(&name);
        Ok(Some(Envelope::bytes(reply)))
    });
    tokio::spawn(async move {
        while let Some(Ok(incoming)) = listener.next().await {
            incoming.serve(router.clone()).unwrap();
        }
    });

    let conn = stranger.other_app("app.files", "public").await.unwrap();
    let reply = conn.call("greet", Some(Envelope::bytes(b"ada".to_vec()))).await.unwrap();
    assert_eq!(reply.and_then(|r| r.bytes), Some(b"hello ada".to_vec()));

    conn.close().await;
    assert!(conn.is_closed());
}
