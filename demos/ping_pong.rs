//! Simple ping-pong example using CMCP
//!
//! A server and a client handshake over the inproc transport, then bounce
//! one application message each way.

use std::sync::mpsc::channel;
use std::time::Duration;

use cmcp::{Client, ClientCallbacks, DataList, Server, ServerCallbacks};

const CMD_PING: u16 = 100;
const CMD_PONG: u16 = 101;
const PARAM_TEXT: u16 = 1;

struct EchoProbe {
    inbox: std::sync::mpsc::Sender<(u16, u16)>,
}

impl ServerCallbacks for EchoProbe {
    fn on_announcement(&mut self, client_id: u16) -> bool {
        println!("server: client {client_id:#06x} announced, accepting");
        true
    }

    fn on_message(&mut self, client_id: u16, command_id: u16, parameters: &DataList<'_>) {
        if let Ok(text) = parameters.find(PARAM_TEXT, 4) {
            println!(
                "server: received command {command_id} from {client_id:#06x}: {:?}",
                std::str::from_utf8(text).unwrap()
            );
        }
        self.inbox.send((client_id, command_id)).unwrap();
    }
}

struct PongPrinter;

impl ClientCallbacks for PongPrinter {
    fn on_message(&mut self, command_id: u16, parameters: &DataList<'_>) {
        if let Ok(text) = parameters.find(PARAM_TEXT, 4) {
            println!(
                "client: received command {command_id}: {:?}",
                std::str::from_utf8(text).unwrap()
            );
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    println!("CMCP Ping-Pong Example");
    println!("======================\n");

    let (inbox, server_messages) = channel();
    let mut server = Server::new();
    server.set_callbacks(EchoProbe { inbox })?;
    server.bind("inproc://ping-pong-pub", "inproc://ping-pong-sub")?;
    println!("server: bound with id {:#06x}", server.id());

    let mut client = Client::new();
    client.set_callbacks(PongPrinter)?;
    client.connect("inproc://ping-pong-sub", "inproc://ping-pong-pub")?;
    println!("client: connected with id {:#06x}\n", client.id());

    // ping
    let mut params = DataList::new();
    params.add(PARAM_TEXT, b"ping")?;
    client.send(CMD_PING, &params)?;

    // wait for the ping to arrive, then pong back
    let (client_id, _command) = server_messages.recv_timeout(Duration::from_secs(2))?;
    let mut params = DataList::new();
    params.add(PARAM_TEXT, b"pong")?;
    server.send(client_id, CMD_PONG, &params)?;

    // give the pong a moment to arrive before tearing down
    std::thread::sleep(Duration::from_millis(200));

    println!("\nping-pong complete");
    Ok(())
}
