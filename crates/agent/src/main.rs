mod constants;
mod interactive;
mod runner;
mod seccomp;
mod utils;

use interactive::InteractiveSession;
use shared::agent_protocol::{AgentRequest, AgentResponse};
use shared::protocol::{FrameError, receive_frame, send_frame};
use tokio_vsock::{VMADDR_CID_ANY, VsockAddr, VsockListener, VsockStream};
use tracing::{error, info, instrument, warn};

#[tokio::main]
async fn main() -> Result<(), AgentError> {
    tracing_subscriber::fmt::init();

    let addr = VsockAddr::new(VMADDR_CID_ANY, constants::DEFAULT_VSOCK_PORT);
    let listener = VsockListener::bind(addr)?;
    info!(port = constants::DEFAULT_VSOCK_PORT, "guest agent listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream).await {
                warn!(%peer, %err, "connection ended with an error");
            }
        });
    }
}

#[instrument(skip(stream))]
async fn handle_connection(mut stream: VsockStream) -> Result<(), AgentError> {
    let frame = receive_frame(&mut stream).await?;
    let request: AgentRequest = postcard::from_bytes(&frame)?;

    match request {
        AgentRequest::Ping => respond(&mut stream, &AgentResponse::Pong).await,
        AgentRequest::RunCommand(req) => {
            let response = match runner::run(&req).await {
                Ok(result) => AgentResponse::CommandResult(result),
                Err(err) => {
                    error!(%err, "run command failed");
                    AgentResponse::Error {
                        message: err.to_string(),
                    }
                }
            };
            respond(&mut stream, &response).await
        }
        AgentRequest::BeginInteractive(req) => {
            let session = match InteractiveSession::spawn(&req) {
                Ok(session) => session,
                Err(err) => {
                    return respond(
                        &mut stream,
                        &AgentResponse::Error {
                            message: err.to_string(),
                        },
                    )
                    .await;
                }
            };
            let pid = session.pid;
            respond(&mut stream, &AgentResponse::InteractiveReady { pid }).await?;
            session.run(stream).await?;
            Ok(())
        }
        AgentRequest::Signal { pid, signum } => {
            let response = if !interactive::is_known_session(pid) {
                AgentResponse::Error {
                    message: format!("no known interactive session with pid {pid}"),
                }
            } else {
                match deliver_signal(pid, signum) {
                    Ok(()) => AgentResponse::SignalDelivered,
                    Err(err) => AgentResponse::Error {
                        message: err.to_string(),
                    },
                }
            };
            respond(&mut stream, &response).await
        }
    }
}

fn deliver_signal(pid: u32, signum: i32) -> Result<(), nix::errno::Errno> {
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::try_from(signum).map_err(|_| nix::errno::Errno::EINVAL)?,
    )
}

async fn respond(stream: &mut VsockStream, response: &AgentResponse) -> Result<(), AgentError> {
    let encoded = postcard::to_allocvec(response)?;
    send_frame(stream, &encoded).await?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum AgentError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}
