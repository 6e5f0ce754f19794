use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::frame::{Command, Frame};

const TEST_SERVER_ADDR: &str = "127.0.0.1:0";
const FRAME_WAIT: Duration = Duration::from_secs(2);

static ONCE: Once = Once::new();

pub fn init_logs() {
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Behaviour {
    Accept,
    RejectConnect(&'static str),
    RejectSubscribe(&'static str),
}

/// A one-endpoint STOMP peer that answers the handshake and receipts,
/// records every client frame and lets a test push frames back.
pub struct ScriptedBroker {
    pub addr: SocketAddr,
    frames: mpsc::UnboundedReceiver<Frame>,
    connections: Arc<Mutex<Vec<mpsc::UnboundedSender<Frame>>>>,
}

impl ScriptedBroker {
    pub async fn start(behaviour: Behaviour) -> Self {
        init_logs();
        let listener = TcpListener::bind(TEST_SERVER_ADDR).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (recorder, frames) = mpsc::unbounded_channel();
        let connections = Arc::new(Mutex::new(Vec::new()));

        let registry = connections.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (outbound, outbound_rx) = mpsc::unbounded_channel();
                registry.lock().unwrap().push(outbound.clone());
                tokio::spawn(serve(stream, behaviour, recorder.clone(), outbound, outbound_rx));
            }
        });

        ScriptedBroker {
            addr,
            frames,
            connections,
        }
    }

    pub fn url(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    pub async fn next_frame(&mut self) -> Frame {
        tokio::time::timeout(FRAME_WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("broker stopped")
    }

    /// Skips frames until one with `command` arrives.
    pub async fn expect(&mut self, command: Command) -> Frame {
        loop {
            let frame = self.next_frame().await;
            if frame.command == command {
                return frame;
            }
        }
    }

    /// Pushes a frame to the most recent client connection.
    pub fn push(&self, frame: Frame) {
        let connections = self.connections.lock().unwrap();
        connections
            .last()
            .expect("no client connected")
            .send(frame)
            .expect("client connection gone");
    }
}

async fn serve(
    stream: TcpStream,
    behaviour: Behaviour,
    recorder: mpsc::UnboundedSender<Frame>,
    outbound: mpsc::UnboundedSender<Frame>,
    mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
) {
    let (mut reader, mut writer) = stream.into_split();
    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let mut buffer = BytesMut::new();
            frame.encode(&mut buffer);
            if writer.write_all(&buffer).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut buffer = BytesMut::new();
    loop {
        while let Ok(Some(frame)) = Frame::decode(&mut buffer) {
            let _ = recorder.send(frame.clone());
            let reply = match (frame.command, behaviour) {
                (Command::Connect, Behaviour::RejectConnect(reason)) => Some(
                    Frame::new(Command::Error).header("message", reason),
                ),
                (Command::Connect, _) => Some(
                    Frame::new(Command::Connected)
                        .header("version", "1.2")
                        .header("server", "ScriptedBroker/1.0"),
                ),
                (Command::Subscribe, Behaviour::RejectSubscribe(reason)) => {
                    let mut error = Frame::new(Command::Error).header("message", reason);
                    if let Some(receipt) = frame.get("receipt") {
                        error = error.header("receipt-id", receipt);
                    }
                    Some(error)
                }
                _ => frame
                    .get("receipt")
                    .map(|receipt| Frame::new(Command::Receipt).header("receipt-id", receipt)),
            };
            if let Some(reply) = reply {
                let _ = outbound.send(reply);
            }
            if frame.command == Command::Disconnect
                || matches!(behaviour, Behaviour::RejectConnect(_))
            {
                return;
            }
        }
        match reader.read_buf(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

pub fn message_frame(subscription: &str, message_id: &str) -> Frame {
    Frame::new(Command::Message)
        .header("subscription", subscription)
        .header("message-id", message_id)
        .header("destination", "/queue/REQUEST")
}
