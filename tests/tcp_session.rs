//! Session behaviour over a real socket against a scripted instrument.

use labctl::codec::{Command, Dialect};
use labctl::session::{InstrumentAddress, Session, SessionContext, SessionState};
use labctl::transport::TcpTransport;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const IDENTITY: &str = "KEITHLEY INSTRUMENTS,MODEL 2230-30-1,9203,1.16";

/// Answer one connection; `:OUTPut?` is answered with `state` after `delay`.
async fn serve_connection(socket: TcpStream, state: &'static str, delay: Duration) {
    let mut socket = BufReader::new(socket);
    let mut line = String::new();
    loop {
        line.clear();
        match socket.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let reply = if line.contains("*IDN?") {
            format!("{IDENTITY}\n")
        } else if line.contains(":SYSTem:ERRor:NEXT?") {
            "0,\"No error\"\n".to_string()
        } else if line.contains(":OUTPut?") {
            tokio::time::sleep(delay).await;
            format!("{state}\n")
        } else {
            continue;
        };
        if socket.get_mut().write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

#[tokio::test]
async fn test_late_reply_is_never_read_by_the_next_command() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        // First link answers too late and claims the output is on; the
        // second answers promptly with the real state.
        let scripts = [("1", Duration::from_millis(300)), ("0", Duration::ZERO)];
        for (state, delay) in scripts {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::spawn(serve_connection(socket, state, delay));
        }
    });

    let session = Session::new(
        InstrumentAddress::new(format!("127.0.0.1:{port}")),
        Dialect::MultiChannelSupply,
        TcpTransport::default(),
        SessionContext::new("tcp_psu").with_read_timeout(Duration::from_millis(100)),
    );
    session.connect(Duration::from_secs(2)).await.unwrap();

    let query = Command::QueryOutput { channel: 1 };
    let err = session.execute(&query).await.unwrap_err();
    assert_eq!(err.kind(), "session.unreachable");
    assert!(err.is_timeout());
    assert_eq!(session.state(), SessionState::Faulted);

    // Let the late reply go out before talking to the instrument again.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let err = session.execute(&query).await.unwrap_err();
    assert_eq!(err.kind(), "session.not_connected");

    session.reconnect(Duration::from_secs(2)).await.unwrap();
    let on = session.execute(&query).await.unwrap();
    assert_eq!(on.as_flag(), Some(false));
    assert_eq!(session.state(), SessionState::Connected);
}
