//! Exercises a platform of in-process apps end to end.
//!
//! `app.store` exposes a `files` service and a `private` one. `app.user`
//! connects, hands the store a file and gets the same file back, streams a
//! byte source into a local sink, and is turned away from `private`.
//!
//!   RUST_LOG=w3nrun=debug cargo run -p w3nprobe

use std::sync::Arc;

use anyhow::bail;
use tracing_subscriber::EnvFilter;

use w3nrpc::ExceptionKind;
use w3nrpc::FailureReason;

use w3nrun::Cap;
use w3nrun::Envelope;
use w3nrun::Error;
use w3nrun::Platform;
use w3nrun::Router;
use w3nrun::ServiceRegistry;
use w3nrun::caps::file::FileView;
use w3nrun::caps::file::MemFile;
use w3nrun::caps::sink::ByteSinkView;
use w3nrun::caps::sink::MemByteSink;
use w3nrun::caps::source::ByteSourceView;
use w3nrun::caps::source::MemByteSource;
use w3nrun::config::AppManifest;
use w3nrun::config::ServiceAccess;

const SOURCE_LEN: u32 = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let platform = Platform::builder()
        .app(AppManifest::new("app.store")
            .service("files", ServiceAccess::any_app())
            .service("private", ServiceAccess::this_app()))
        .app(AppManifest::new("app.user"))
        .build();

    let store = platform.registry("app.store", Some("server"))?;
    let user = platform.registry("app.user", Some("ui"))?;

    serve(&store, "files", store_router())?;
    serve(&store, "private", Router::new())?;

    exposure_conflict(&store)?;
    pass_file(&user).await?;
    stream_source(&user).await?;
    refused_caller(&user).await?;

    platform.shutdown();
    tracing::info!("all scenarios passed");
    Ok(())
}

fn serve(registry: &ServiceRegistry, service: &str, router: Router) -> anyhow::Result<()> {
    let mut listener = registry.expose_service(service)?;
    tokio::spawn(async move {
        while let Some(item) = listener.next().await {
            match item {
                Ok(incoming) => {
                    tracing::info!(
                        service = incoming.service(),
                        caller = incoming.caller_app().unwrap_or("?"),
                        "accepted connection",
                    );
                    if let Err(exc) = incoming.serve(router.clone()) {
                        tracing::warn!(%exc, "could not serve connection");
                    }
                }
                Err(exc) => tracing::warn!(%exc, "listener failed"),
            }
        }
    });
    Ok(())
}

fn store_router() -> Router {
    Router::new()
        .reply("readAndPassFile", |args: Option<Envelope>| async move {
            let file = args.as_ref().and_then(|a| a.cap(0)).cloned()
                .ok_or_else(|| FailureReason::Handler("expected a file".into()))?;
            let view = FileView::new(file.clone()).map_err(Error::into_failure)?;
            let text = view.read_txt().await.map_err(Error::into_failure)?;
            tracing::info!(text = %text, "store read the passed file");
            Ok(Some(Envelope::caps(vec![file])))
        })
        .reply("getSource", |_| async move {
            let bytes: Vec<u8> = (0..SOURCE_LEN).map(|i| (i % 251) as u8).collect();
            let source: Cap = Arc::new(MemByteSource::new(bytes));
            Ok(Some(Envelope::caps(vec![source])))
        })
}

fn exposure_conflict(store: &ServiceRegistry) -> anyhow::Result<()> {
    match store.expose_service("files") {
        Ok(_) => bail!("a second listener for 'files' was accepted"),
        Err(exc) if exc.kind == ExceptionKind::ServiceAlreadyExposed => {
            tracing::info!(%exc, "second expose refused");
            Ok(())
        }
        Err(exc) => Err(exc.into()),
    }
}

async fn pass_file(user: &ServiceRegistry) -> anyhow::Result<()> {
    let conn = user.other_app("app.store", "files").await?;
    let file: Cap = Arc::new(MemFile::new("note.txt", "hello from app.user"));

    let reply = conn.call("readAndPassFile", Some(Envelope::caps(vec![file.clone()]))).await?;
    let returned = reply.as_ref().and_then(|r| r.cap(0))
        .ok_or_else(|| anyhow::anyhow!("store replied without a file"))?;
    if !Arc::ptr_eq(returned, &file) {
        bail!("the file came back as a different object");
    }
    tracing::info!(
        exported = conn.exported_objects(),
        imported = conn.imported_objects(),
        "file came back as the original object",
    );

    conn.close().await;
    Ok(())
}

async fn stream_source(user: &ServiceRegistry) -> anyhow::Result<()> {
    let conn = user.other_app("app.store", "files").await?;
    let reply = conn.call("getSource", None).await?;
    let cap = reply.as_ref().and_then(|r| r.cap(0)).cloned()
        .ok_or_else(|| anyhow::anyhow!("store replied without a source"))?;
    let source = ByteSourceView::new(cap)?;

    let sink = Arc::new(MemByteSink::new());
    let written = source.pipe_to(ByteSinkView::new(sink.clone())?, 4096).await?;
    if written != u64::from(SOURCE_LEN) || !sink.is_done() {
        bail!("piped {} bytes, sink done: {}", written, sink.is_done());
    }
    tracing::info!(written, "streamed source into local sink");

    conn.close().await;
    Ok(())
}

async fn refused_caller(user: &ServiceRegistry) -> anyhow::Result<()> {
    match user.other_app("app.store", "private").await {
        Ok(_) => bail!("app.user reached a this-app service"),
        Err(exc) if exc.kind == ExceptionKind::CallerNotAllowed => {
            tracing::info!(%exc, "caller refused");
            Ok(())
        }
        Err(exc) => Err(exc.into()),
    }
}
