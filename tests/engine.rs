//! End-to-end exercises of the session engine over its real control socket.

use std::path::Path;

use stevedore::{wire, Container, Engine, HookRegistry};
use tokio::{
    io::BufReader,
    net::{
        unix::{OwnedReadHalf, OwnedWriteHalf},
        UnixStream,
    },
    sync::oneshot,
};

async fn start_engine(dir: &Path) -> Engine {
    let c0 = Container::create("0", dir).await.unwrap();
    let eng = Engine::new(c0, HookRegistry::default()).await.unwrap();
    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::task::spawn(eng.clone().listen_and_serve(ready_tx));
    ready_rx.await.unwrap();
    eng
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(eng: &Engine) -> Self {
        let stream = UnixStream::connect(eng.socket_path()).await.unwrap();
        let (rd, wr) = stream.into_split();
        Self {
            reader: BufReader::new(rd),
            writer: wr,
        }
    }

    async fn op(&mut self, op_args: &[&str]) -> (char, String) {
        let op_args: Vec<String> = op_args.iter().map(|s| (*s).to_owned()).collect();
        wire::write_op(&mut self.writer, &op_args).await.unwrap();
        wire::read_reply(&mut self.reader).await.unwrap()
    }

    async fn expect_ok(&mut self, op_args: &[&str]) {
        let (code, text) = self.op(op_args).await;
        assert_eq!(code, '+', "op {op_args:?} failed: {text}");
    }
}

#[tokio::test]
async fn startup_layout_and_die() {
    let tmp = tempfile::tempdir().unwrap();
    let eng = start_engine(tmp.path()).await;

    // the root container is marked as an initialized engine root
    let id = tokio::fs::read_to_string(tmp.path().join(".docker/engine/id"))
        .await
        .unwrap();
    let id = id.trim();
    assert_eq!(id.len(), 64);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    // containers/0 resolves back to the root itself
    let zero = tmp.path().join(".docker/engine/containers/0");
    assert!(tokio::fs::read_link(&zero).await.is_ok());
    assert_eq!(
        tokio::fs::canonicalize(&zero).await.unwrap(),
        tokio::fs::canonicalize(tmp.path()).await.unwrap()
    );
    assert!(eng.socket_path().exists());

    let mut client = Client::connect(&eng).await;
    let (code, text) = client.op(&["die"]).await;
    assert_eq!((code, text.as_str()), ('+', "OK"));

    eng.cleanup().await;
    assert!(!eng.socket_path().exists());
}

#[tokio::test]
async fn cd_name_ls_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let eng = start_engine(tmp.path()).await;
    let mut client = Client::connect(&eng).await;

    client.expect_ok(&["cd", "/"]).await;
    client.expect_ok(&["cd", "0"]).await;
    client.expect_ok(&["name", "foo"]).await;
    client.expect_ok(&["ls"]).await;
    client.expect_ok(&["die"]).await;

    // the alias landed as a symlink in the containers store
    let link = tmp.path().join(".docker/engine/containers/foo");
    assert!(tokio::fs::read_link(&link).await.is_ok());
    // and shows up as a child of the root container
    let children = eng.root().list_children().await.unwrap();
    assert!(children.contains(&"foo".to_owned()), "{children:?}");
}

#[tokio::test]
async fn clone_copies_and_refuses_cycles() {
    let tmp = tempfile::tempdir().unwrap();
    let eng = start_engine(tmp.path()).await;

    // the target container to clone from, with some payload
    let target = eng.root().create_child().await.unwrap();
    tokio::fs::write(target.root.join("payload"), b"cargo")
        .await
        .unwrap();

    // this session's scratch context allocates the next id
    let mut client = Client::connect(&eng).await;
    let scratch_id = format!("{}", target.id.parse::<u64>().unwrap() + 1);
    let clone_src = format!("/{}", target.id);
    client.expect_ok(&["clone", clone_src.as_str()]).await;
    client.expect_ok(&["die"]).await;
    let scratch = eng.root().get_child(&scratch_id).await.unwrap();
    let copied = tokio::fs::read(scratch.root.join("payload")).await.unwrap();
    assert_eq!(copied, b"cargo");

    // cloning the context into itself is refused and closes the session
    let mut client = Client::connect(&eng).await;
    client.expect_ok(&["cd", "/"]).await;
    let (code, text) = client.op(&["clone", "/"]).await;
    assert_eq!(code, '-');
    assert!(text.contains("Can't clone: circular reference"), "{text}");
}

#[tokio::test]
async fn malformed_request_fails_session_not_listener() {
    use tokio::io::AsyncWriteExt;

    let tmp = tempfile::tempdir().unwrap();
    let eng = start_engine(tmp.path()).await;

    let stream = UnixStream::connect(eng.socket_path()).await.unwrap();
    let (rd, mut wr) = stream.into_split();
    let mut reader = BufReader::new(rd);
    wr.write_all(b"*2\r\n$3\r\ncd\r\nX").await.unwrap();
    // the peer closes after the error line, so a short write is also possible
    let _ = wr.shutdown().await;
    let (code, text) = wire::read_reply(&mut reader).await.unwrap();
    assert_eq!(code, '-');
    assert!(text.contains("Malformed request"), "{text}");

    // a fresh connection still works
    let mut client = Client::connect(&eng).await;
    client.expect_ok(&["die"]).await;
}

#[tokio::test]
async fn unknown_ops_are_persisted_before_execution() {
    let tmp = tempfile::tempdir().unwrap();
    let eng = start_engine(tmp.path()).await;
    let mut client = Client::connect(&eng).await;

    // in this test environment the engine binary is the test harness, so the
    // helper subprocess fails; the command manifest must still be recorded
    let (_, _) = client.op(&["version", "--full"]).await;

    let scratch = eng.root().get_child("1").await.unwrap();
    let cmd = scratch.get_command("1").await.unwrap();
    assert_eq!(cmd.path, "docker");
    assert_eq!(
        cmd.args,
        vec!["-e".to_owned(), "version".to_owned(), "--full".to_owned()]
    );
    assert_eq!(cmd.dir, "/.docker/engine/containers/1");
}

#[tokio::test]
async fn stale_socket_is_recovered_live_socket_is_not() {
    let tmp = tempfile::tempdir().unwrap();
    let c0 = Container::create("0", tmp.path()).await.unwrap();
    let eng = Engine::new(c0, HookRegistry::default()).await.unwrap();

    // a leftover regular file where the socket goes is cleaned up
    tokio::fs::create_dir_all(eng.socket_path().parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(eng.socket_path(), b"stale").await.unwrap();
    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::task::spawn(eng.clone().listen_and_serve(ready_tx));
    ready_rx.await.unwrap();
    let mut client = Client::connect(&eng).await;
    client.expect_ok(&["die"]).await;

    // but an address something is answering on aborts the second engine
    let (ready_tx, ready_rx) = oneshot::channel();
    let res = eng.clone().listen_and_serve(ready_tx).await;
    assert!(res.is_err());
    assert!(ready_rx.await.is_err());
}

#[tokio::test]
async fn sessions_are_isolated() {
    let tmp = tempfile::tempdir().unwrap();
    let eng = start_engine(tmp.path()).await;

    // two concurrent sessions get distinct scratch contexts
    let mut a = Client::connect(&eng).await;
    a.expect_ok(&["ls"]).await;
    let mut b = Client::connect(&eng).await;
    b.expect_ok(&["ls"]).await;
    // killing one session with a bad op leaves the other serving
    let (code, _) = a.op(&["cd", "/definitely/not/here"]).await;
    assert_eq!(code, '-');
    b.expect_ok(&["cd", "/"]).await;
    b.expect_ok(&["die"]).await;

    let children = eng.root().list_children().await.unwrap();
    assert!(children.len() >= 2, "{children:?}");
}
