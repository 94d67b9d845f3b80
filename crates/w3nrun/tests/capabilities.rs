//! Objects passed across links: files, filesystems, byte streams and nested
//! connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use w3nrpc::CloseReason;
use w3nrpc::ExceptionKind;
use w3nrpc::FailureReason;
use w3nrpc::ObjectKind;

use w3nrun::CallEvent;
use w3nrun::Cap;
use w3nrun::Envelope;
use w3nrun::Error;
use w3nrun::OutgoingMsg;
use w3nrun::Platform;
use w3nrun::Router;
use w3nrun::ServiceRegistry;
use w3nrun::caps::conn::ConnectionCap;
use w3nrun::caps::conn::IncomingCap;
use w3nrun::caps::conn::RemoteConnection;
use w3nrun::caps::conn::RemoteIncoming;
use w3nrun::caps::conn::RemoteIncomingMsg;
use w3nrun::caps::file::FileView;
use w3nrun::caps::file::MemFile;
use w3nrun::caps::fs::FsView;
use w3nrun::caps::fs::MemFs;
use w3nrun::caps::sink::ByteSinkView;
use w3nrun::caps::sink::MemByteSink;
use w3nrun::caps::source::ByteSourceView;
use w3nrun::caps::source::MemByteSource;
use w3nrun::config::AppManifest;
use w3nrun::config::ServiceAccess;

fn platform() -> Platform {
    Platform::builder()
        .app(AppManifest::new("app.store")
            .service("files", ServiceAccess::any_app())
            .service("relay", ServiceAccess::any_app()))
        .app(AppManifest::new("app.user"))
        .build()
}

fn registries(platform: &Platform) -> (ServiceRegistry, ServiceRegistry) {
    (
        platform.registry("app.store", None).unwrap(),
        platform.registry("app.user", None).unwrap(),
    )
}

fn serve(registry: &ServiceRegistry, service: &str, router: Router) -> JoinHandle<()> {
    let mut listener = registry.expose_service(service).unwrap();
    tokio::spawn(async move {
        while let Some(Ok(incoming)) = listener.next().await {
            incoming.serve(router.clone()).unwrap();
        }
    })
}

fn first_cap(args: Option<Envelope>) -> Result<Cap, FailureReason> {
    args.and_then(|a| a.caps)
        .and_then(|caps| caps.into_iter().next())
        .ok_or_else(|| FailureReason::Handler("expected an object".into()))
}

/// Hands out one shared object of each kind.
fn store_router(fs: Arc<MemFs>, sink: Arc<MemByteSink>, source: Arc<MemByteSource>) -> Router {
    Router::new()
        .reply("readAndPassFile", |args: Option<Envelope>| async move {
            let file = first_cap(args)?;
            let text = FileView::new(file.clone())
                .map_err(Error::into_failure)?
                .read_txt()
                .await
                .map_err(Error::into_failure)?;
            Ok(Some(Envelope::bytes(text.into_bytes()).with_caps(vec![file])))
        })
        .reply("getFs", move |_| {
            let fs: Cap = fs.clone();
            async move { Ok(Some(Envelope::caps(vec![fs]))) }
        })
        .reply("getSink", move |_| {
            let sink: Cap = sink.clone();
            async move { Ok(Some(Envelope::caps(vec![sink]))) }
        })
        .reply("getSource", move |_| {
            let source: Cap = source.clone();
            async move { Ok(Some(Envelope::caps(vec![source]))) }
        })
}

fn store(registry: &ServiceRegistry) -> (Arc<MemFs>, Arc<MemByteSink>, JoinHandle<()>) {
    let fs = Arc::new(MemFs::new().with_file("notes.txt", "first draft"));
    let sink = Arc::new(MemByteSink::new());
    let source = Arc::new(MemByteSource::new((0..=255u8).cycle().take(10_000).collect::<Vec<_>>()));
    let server = serve(registry, "files", store_router(fs.clone(), sink.clone(), source));
    (fs, sink, server)
}

#[tokio::test]
async fn test_read_and_pass_file() {
    let platform = platform();
    let (store_reg, user) = registries(&platform);
    let (_fs, _sink, _server) = store(&store_reg);

    let conn = user.other_app("app.store", "files").await.unwrap();
    let file: Cap = Arc::new(MemFile::new("greeting.txt", "Hello, wörld"));

    let reply = conn.call("readAndPassFile", Some(Envelope::caps(vec![file.clone()])))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reply.bytes.as_deref(), Some("Hello, wörld".as_bytes()));
    let echoed = reply.cap(0).unwrap();
    assert!(Arc::ptr_eq(echoed, &file), "echoed reference must resolve to the original file");
    assert_eq!(conn.imported_objects(), 0);
}

#[tokio::test]
async fn test_remote_filesystem() {
    let platform = platform();
    let (store_reg, user) = registries(&platform);
    let (fs, _sink, _server) = store(&store_reg);

    let conn = user.other_app("app.store", "files").await.unwrap();
    let reply = conn.call("getFs", None).await.unwrap();
    let remote = FsView::new(reply.unwrap().cap(0).unwrap().clone()).unwrap();

    assert_eq!(remote.read_txt("notes.txt").await.unwrap(), "first draft");
    remote.write_txt("notes.txt", "second draft").await.unwrap();
    remote.write_bytes("data.bin", &[1, 2, 3]).await.unwrap();

    assert_eq!(fs.file("notes.txt").unwrap().contents(), b"second draft".to_vec());
    assert_eq!(remote.list_folder(None).await.unwrap(), vec!["data.bin", "notes.txt"]);
    assert_eq!(remote.list_folder(Some("no")).await.unwrap(), vec!["notes.txt"]);
    assert!(remote.check_file_presence("data.bin").await.unwrap());

    let a = remote.get_file("notes.txt", false).await.unwrap();
    let b = remote.get_file("notes.txt", false).await.unwrap();
    assert!(Arc::ptr_eq(a.object(), b.object()));
    assert_eq!(a.stat().await.unwrap().size, 12);
    assert_eq!(a.read_bytes(Some(7), None).await.unwrap(), b"draft".to_vec());

    let created = remote.get_file("new.txt", true).await.unwrap();
    created.write_txt("fresh").await.unwrap();
    assert_eq!(remote.read_txt("new.txt").await.unwrap(), "fresh");

    remote.delete_file("data.bin").await.unwrap();
    assert!(!remote.check_file_presence("data.bin").await.unwrap());

    let err = remote.read_txt("data.bin").await.unwrap_err();
    assert!(matches!(err, Error::Remote(FailureReason::Handler(_))));
}

#[tokio::test]
async fn test_remote_splice_clamps_oversized_delete() {
    let platform = platform();
    let (store_reg, user) = registries(&platform);
    let (_fs, sink, _server) = store(&store_reg);

    let conn = user.other_app("app.store", "files").await.unwrap();
    let reply = conn.call("getSink", None).await.unwrap();
    let remote = ByteSinkView::new(reply.unwrap().cap(0).unwrap().clone()).unwrap();

    remote.write_at(0, b"abc").await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), remote.splice(1, u64::MAX, b"x"))
        .await
        .expect("splice left open")
        .unwrap();
    assert_eq!(sink.contents(), b"ax".to_vec());

    assert!(remote.splice(u64::MAX, 1, b"y").await.is_err());
    assert_eq!(remote.get_size().await.unwrap(), 2);
}

#[tokio::test]
async fn test_pipe_into_remote_sink_finalizes_once() {
    let platform = platform();
    let (store_reg, user) = registries(&platform);
    let (_fs, sink, _server) = store(&store_reg);

    let conn = user.other_app("app.store", "files").await.unwrap();
    let reply = conn.call("getSink", None).await.unwrap();
    let remote_sink = ByteSinkView::new(reply.unwrap().cap(0).unwrap().clone()).unwrap();

    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    let source = ByteSourceView::new(Arc::new(MemByteSource::new(payload.clone()))).unwrap();

    let written = source.pipe_to(remote_sink.clone(), 4096).await.unwrap();
    assert_eq!(written, payload.len() as u64);
    assert_eq!(sink.contents(), payload);
    assert!(sink.is_done());
    assert_eq!(sink.done_calls(), 1);
    assert_eq!(sink.done_error(), None);

    assert!(remote_sink.write_at(0, b"late").await.is_err());
    assert_eq!(remote_sink.get_size().await.unwrap(), payload.len() as u64);
}

#[tokio::test]
async fn test_abandoned_bridge_finalizes_with_error() {
    let sink = Arc::new(MemByteSink::new());
    let view = ByteSinkView::new(sink.clone()).unwrap();

    let bridge = view.bridge();
    bridge.push(Some(b"abc".to_vec()), None).await.unwrap();
    bridge.push(Some(b"def".to_vec()), None).await.unwrap();
    assert!(bridge.finish().await.is_err());

    assert_eq!(sink.contents(), b"abcdef".to_vec());
    assert_eq!(sink.done_calls(), 1);
    assert!(sink.done_error().is_some());
}

#[tokio::test]
async fn test_bridge_refuses_after_finalizing() {
    let sink = Arc::new(MemByteSink::new());
    let bridge = ByteSinkView::new(sink.clone()).unwrap().bridge();

    bridge.push(Some(b"x".to_vec()), None).await.unwrap();
    bridge.push(None, Some(FailureReason::Handler("source broke".into()))).await.unwrap();
    assert!(bridge.push(Some(b"y".to_vec()), None).await.is_err());
    assert!(bridge.valve().is_poisoned());

    assert_eq!(bridge.finish().await, Err(FailureReason::Handler("source broke".into())));
    assert_eq!(sink.done_calls(), 1);
    assert_eq!(sink.done_error().as_deref(), Some("handler failed: source broke"));
}

#[tokio::test]
async fn test_stream_remote_source() {
    let platform = platform();
    let (store_reg, user) = registries(&platform);
    let (_fs, _sink, _server) = store(&store_reg);

    let conn = user.other_app("app.store", "files").await.unwrap();
    let reply = conn.call("getSource", None).await.unwrap();
    let source = ByteSourceView::new(reply.unwrap().cap(0).unwrap().clone()).unwrap();
    assert_eq!(source.get_size().await.unwrap(), 10_000);

    source.seek(9_000).await.unwrap();
    let (chunks, end) = source.stream(256).unwrap().collect().await;
    assert!(end.is_ok());
    assert_eq!(chunks.len(), 4);

    let streamed: Vec<u8> = chunks.into_iter().flatten().filter_map(|c| c.bytes).flatten().collect();
    let expected: Vec<u8> = (0..=255u8).cycle().take(10_000).skip(9_000).collect();
    assert_eq!(streamed, expected);
    assert_eq!(source.get_position().await.unwrap(), 10_000);
    assert_eq!(source.read(10).await.unwrap(), None);
}

#[tokio::test]
async fn test_stream_stops_on_cancel() {
    let source = ByteSourceView::new(Arc::new(MemByteSource::new(vec![7u8; 1_000_000]))).unwrap();

    let mut events = source.stream(10).unwrap();
    assert!(matches!(events.next().await, Some(CallEvent::Next(Some(_)))));
    events.cancel();
    assert!(events.next().await.is_none());

    let position = source.get_position().await.unwrap();
    assert!(position < 1_000_000, "stream kept reading after cancel");
}

#[tokio::test]
async fn test_proxy_fails_after_close() {
    let platform = platform();
    let (store_reg, user) = registries(&platform);
    let (_fs, _sink, _server) = store(&store_reg);

    let conn = user.other_app("app.store", "files").await.unwrap();
    let reply = conn.call("getFs", None).await.unwrap();
    let remote = FsView::new(reply.unwrap().cap(0).unwrap().clone()).unwrap();
    assert_eq!(conn.imported_objects(), 1);

    conn.close().await;
    assert_eq!(conn.imported_objects(), 0);

    let err = remote.read_txt("notes.txt").await.unwrap_err();
    let exc = err.as_rpc().unwrap();
    assert_eq!(exc.kind, ExceptionKind::ConnectionClosed(CloseReason::Local));
}

#[tokio::test]
async fn test_wrong_kind_is_rejected_by_views() {
    let file: Cap = Arc::new(MemFile::new("a", ""));
    let err = FsView::new(file).err().unwrap();
    assert_eq!(err, Error::WrongKind { expected: ObjectKind::FsImpl, found: ObjectKind::File });
}

#[tokio::test]
async fn test_connection_passed_to_another_service() {
    let platform = platform();
    let (store_reg, user) = registries(&platform);

    let _files = serve(&store_reg, "files", Router::new()
        .reply("ping", |_| async { Ok(Some(Envelope::bytes(b"pong".to_vec()))) }));
    let _relay = serve(&store_reg, "relay", Router::new()
        .reply("forward", |args: Option<Envelope>| async move {
            let conn = RemoteConnection::new(first_cap(args)?).map_err(Error::into_failure)?;
            conn.call("ping", None).await
        }));

    let files = user.other_app("app.store", "files").await.unwrap();
    let relay = user.other_app("app.store", "relay").await.unwrap();

    let handle: Cap = Arc::new(ConnectionCap::new(files.clone()));
    let reply = relay.call("forward", Some(Envelope::caps(vec![handle.clone()]))).await.unwrap();
    assert_eq!(reply.and_then(|r| r.bytes), Some(b"pong".to_vec()));

    RemoteConnection::new(handle).unwrap().close().await.unwrap();
    assert!(files.is_closed());
}

#[tokio::test]
async fn test_incoming_connection_as_object() {
    let platform = platform();
    let (store_reg, user) = registries(&platform);

    let mut listener = store_reg.expose_service("files").unwrap();
    let conn = user.other_app("app.store", "files").await.unwrap();
    let incoming = listener.next().await.unwrap().unwrap();

    let remote = RemoteIncoming::new(Arc::new(IncomingCap::new(incoming))).unwrap();
    let mut stream = remote.watch();

    let attached: Cap = Arc::new(MemFile::new("att.txt", "attachment"));
    let pending = {
        let conn = conn.clone();
        let args = Envelope::bytes(b"question".to_vec()).with_caps(vec![attached.clone()]);
        tokio::spawn(async move { conn.call("ask", Some(args)).await })
    };

    let Some(Ok(RemoteIncomingMsg::Start { call_num, method, data })) = stream.next().await else {
        panic!("expected start");
    };
    assert_eq!(method, "ask");
    let data = data.unwrap();
    assert_eq!(data.bytes, Some(b"question".to_vec()));
    let file = FileView::new(data.cap(0).unwrap().clone()).unwrap();
    assert_eq!(file.read_txt().await.unwrap(), "attachment");

    remote.send(OutgoingMsg::end(call_num, Some(Envelope::bytes(b"answer".to_vec())))).await.unwrap();
    let reply = pending.await.unwrap().unwrap();
    assert_eq!(reply.and_then(|r| r.bytes), Some(b"answer".to_vec()));

    let failing = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.call("doubt", None).await })
    };
    let Some(Ok(RemoteIncomingMsg::Start { call_num, .. })) = stream.next().await else {
        panic!("expected start");
    };
    let reason = FailureReason::Handler("not today".into());
    remote.send(OutgoingMsg::error(call_num, reason.clone())).await.unwrap();
    assert_eq!(failing.await.unwrap().unwrap_err(), reason);

    remote.close().await.unwrap();
    assert!(stream.next().await.is_none());
    assert_eq!(conn.closed().await, CloseReason::Peer);
}
