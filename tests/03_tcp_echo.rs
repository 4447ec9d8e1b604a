mod support;

use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{sleep, timeout},
};

use crabgate::management::export::{REGION_LEN, VERSION};

const HOST: &str = "127.0.0.1";

#[tokio::test]
async fn binary_echoes_and_exports_counters() {
    let dir = tempfile::tempdir().unwrap();
    let port = support::reserve_port(HOST);
    let export = dir.path().join("counters.bin");
    let config_path = dir.path().join("crabgate.toml");

    std::fs::write(
        &config_path,
        format!(
            r#"
[gateway]
name = "itest"
workers = 2
management_session_threshold = 4
report_interval = "100ms"
export_file = "{}"

[[services]]
name = "echo"
listen = ["{HOST}:{port}"]
"#,
            export.display()
        ),
    )
    .unwrap();

    let mut child = support::spawn_crabgate(&config_path);
    support::wait_for_listen(HOST, port).await;

    let mut stream = TcpStream::connect((HOST, port)).await.unwrap();
    stream.write_all(b"hello crab").await.unwrap();

    let mut echoed = vec![0u8; 10];
    timeout(Duration::from_secs(2), stream.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&echoed, b"hello crab");

    let mut region = Vec::new();
    for _ in 0..40 {
        if let Ok(bytes) = tokio::fs::read(&export).await {
            if bytes.len() == REGION_LEN {
                region = bytes;
                break;
            }
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(region.len(), REGION_LEN, "export file never appeared");

    let version = i32::from_ne_bytes(region[0..4].try_into().unwrap());
    assert_eq!(version, VERSION);

    drop(stream);
    let _ = child.kill();
    let _ = child.wait();
}
