//! End-to-end file transfer: REQUEST answered with DATA or DENY.

use std::path::PathBuf;
use std::time::Duration;

use udp_stream::transfer::{self, Served, TransferError};
use udp_stream::{Acceptor, Stream, StreamConfig};

const WAIT: Duration = Duration::from_secs(20);

fn fast() -> StreamConfig {
    StreamConfig::default().with_retransmit_timeout(Duration::from_millis(50))
}

/// A scratch directory unique to this test process and `tag`.
async fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("udp-stream-{}-{tag}", std::process::id()));
    tokio::fs::create_dir_all(&dir).await.expect("create scratch dir");
    dir
}

#[tokio::test]
async fn test_file_round_trip() {
    let root = scratch_dir("round-trip").await;
    let contents: Vec<u8> = (0..20_000u32).map(|i| (i % 97) as u8).collect();
    tokio::fs::write(root.join("data.bin"), &contents)
        .await
        .unwrap();

    let acceptor = Acceptor::bind_addr("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let connector = acceptor.connector();

    let server_root = root.clone();
    let server = tokio::spawn(async move {
        let stream = Stream::accept(&acceptor, fast().with_loss(0.02).with_loss_seed(3))
            .await
            .expect("accept");
        let served = transfer::serve_request(&stream, &server_root, WAIT)
            .await
            .expect("serve");
        stream.close().await.expect("server close");
        served
    });

    let client = Stream::connect(&connector, fast().with_loss(0.02).with_loss_seed(5))
        .await
        .expect("connect");
    let fetched = transfer::fetch_file(&client, "data.bin", WAIT)
        .await
        .expect("fetch");
    assert_eq!(fetched, contents);
    client.close().await.expect("client close");

    assert_eq!(
        server.await.unwrap(),
        Served::Sent {
            filename: "data.bin".into(),
            bytes: contents.len()
        }
    );
    let _ = tokio::fs::remove_dir_all(&root).await;
}

#[tokio::test]
async fn test_missing_file_is_denied() {
    let root = scratch_dir("denied").await;

    let acceptor = Acceptor::bind_addr("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let connector = acceptor.connector();

    let server_root = root.clone();
    let server = tokio::spawn(async move {
        let stream = Stream::accept(&acceptor, fast()).await.expect("accept");
        let served = transfer::serve_request(&stream, &server_root, WAIT)
            .await
            .expect("serve");
        stream.close().await.expect("server close");
        served
    });

    let client = Stream::connect(&connector, fast()).await.expect("connect");
    let err = transfer::fetch_file(&client, "../escape.txt", WAIT)
        .await
        .unwrap_err();
    assert!(matches!(&err, TransferError::Denied(name) if name == "../escape.txt"), "{err:?}");
    client.close().await.expect("client close");

    assert_eq!(
        server.await.unwrap(),
        Served::Denied {
            filename: "../escape.txt".into()
        }
    );
    let _ = tokio::fs::remove_dir_all(&root).await;
}
