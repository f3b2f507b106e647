//! The agent's CLI-facing IPC server (§6): a Unix domain socket, framed
//! length-prefixed, carrying plain `IpcRequest`/`IpcResponse` JSON values
//! rather than the hub's JSON-RPC envelope — there's exactly one agent
//! per socket and no concurrent multiplexed calls to route by id, so the
//! request/response pairing the envelope exists for isn't needed here.

use std::path::Path;

use boardshare_protocol::ipc::{ExitCode, IpcRequest, IpcResponse};
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use crate::reservation::{AgentError, LocalState, ReservationHandle};

pub async fn run(socket_path: &Path, reservations: ReservationHandle) -> std::io::Result<()> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    set_group_restricted_mode(socket_path);
    info!(path = %socket_path.display(), "ipc socket listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let reservations = reservations.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, reservations).await {
                warn!(%err, "ipc connection ended with error");
            }
        });
    }
}

#[cfg(unix)]
fn set_group_restricted_mode(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(0o660);
        let _ = std::fs::set_permissions(path, perms);
    }
}

async fn handle_connection(
    stream: UnixStream,
    reservations: ReservationHandle,
) -> std::io::Result<()> {
    let mut transport = boardshare_protocol::framing::frame_transport(stream);
    while let Some(frame) = transport.next().await {
        let bytes = frame?;
        let Ok(request): Result<IpcRequest, _> = serde_json::from_slice(&bytes) else {
            continue;
        };
        let response = dispatch(request, &reservations).await;
        let bytes = serde_json::to_vec(&response)?;
        transport.send(bytes.into()).await?;
    }
    Ok(())
}

async fn dispatch(request: IpcRequest, reservations: &ReservationHandle) -> IpcResponse {
    match request {
        IpcRequest::Reserve { spec } => match reservations.reserve(spec).await {
            Ok(name) => IpcResponse::Reserved { name },
            Err(err) => error_response(err),
        },
        IpcRequest::Attach { name } => match reservations.attach(name).await {
            Ok(()) => IpcResponse::Ok,
            Err(err) => error_response(err),
        },
        IpcRequest::Detach { name } => match reservations.detach(name).await {
            Ok(()) => IpcResponse::Ok,
            Err(err) => error_response(err),
        },
        IpcRequest::Return { name } => match reservations.return_reservation(name).await {
            Ok(()) => IpcResponse::Ok,
            Err(err) => error_response(err),
        },
        IpcRequest::Edit { name, spec } => match reservations.edit(name, spec).await {
            Ok(()) => IpcResponse::Ok,
            Err(err) => error_response(err),
        },
        IpcRequest::List => IpcResponse::List {
            reservations: reservations
                .list()
                .await
                .into_iter()
                .map(to_wire_summary)
                .collect(),
        },
        IpcRequest::Status => {
            let (summaries, connected) = reservations.status().await;
            IpcResponse::Status {
                reservations: summaries.into_iter().map(to_wire_summary).collect(),
                connected,
            }
        }
    }
}

fn to_wire_summary(
    summary: crate::reservation::ReservationSummary,
) -> boardshare_protocol::ipc::ReservationSummary {
    boardshare_protocol::ipc::ReservationSummary {
        name: summary.name,
        state: match summary.state {
            LocalState::Pending => "pending".to_string(),
            LocalState::Allocated => "allocated".to_string(),
            LocalState::Attached => "attached".to_string(),
            LocalState::Returned => "returned".to_string(),
        },
        place_id: summary.place_id,
        return_reason: summary.return_reason.map(return_reason_str),
    }
}

fn return_reason_str(reason: boardshare_model::ReturnReason) -> String {
    use boardshare_model::ReturnReason::*;
    match reason {
        Requested => "requested",
        CandidatesGone => "candidates_gone",
        ExporterGone => "exporter_gone",
        SessionClosed => "session_closed",
        AutoReturn => "auto_return",
    }
    .to_string()
}

fn error_response(err: AgentError) -> IpcResponse {
    let code = match err {
        AgentError::NotFound => ExitCode::NoMatch,
        AgentError::WrongState(_) => ExitCode::GenericFailure,
        AgentError::Hub(_) => ExitCode::GenericFailure,
    };
    IpcResponse::Error {
        code,
        message: err.to_string(),
    }
}
