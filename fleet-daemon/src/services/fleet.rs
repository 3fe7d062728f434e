//! FleetService gRPC implementation.

use fleet_proto::fleet_service_server::FleetService;
use fleet_proto::{Ack, CheckInRequest, CheckInResponse, ProfileReport, VersionStatus};
use tonic::{Request, Response, Status};

use super::EnrollmentRateLimiter;
use crate::checkin::{CheckInError, CheckInHandler};
use crate::tls::TlsConnectInfo;

/// Implementation of the FleetService gRPC service.
#[derive(Clone)]
pub struct FleetServiceImpl {
    handler: CheckInHandler,
    limiter: EnrollmentRateLimiter,
}

impl FleetServiceImpl {
    pub fn new(handler: CheckInHandler, limiter: EnrollmentRateLimiter) -> Self {
        Self { handler, limiter }
    }
}

/// Common name of the verified client certificate, if the connection
/// presented one.
fn peer_subject<T>(request: &Request<T>) -> Option<String> {
    request
        .extensions()
        .get::<TlsConnectInfo>()
        .and_then(|info| info.peer_subject.clone())
}

#[tonic::async_trait]
impl FleetService for FleetServiceImpl {
    async fn check_in(
        &self,
        request: Request<CheckInRequest>,
    ) -> Result<Response<CheckInResponse>, Status> {
        let peer = peer_subject(&request);
        let req = request.into_inner();

        // unsupported versions are answered in-band and never count as attempts
        let rejected = self.handler.version_status(req.proto_version) == VersionStatus::Rejected;
        if req.agent_id.is_empty() && !rejected {
            self.limiter.check()?;
        }

        let resp = self
            .handler
            .handle_check_in(&req, peer.as_deref())
            .await
            .map_err(into_status)?;
        Ok(Response::new(resp))
    }

    async fn report_profile(
        &self,
        request: Request<ProfileReport>,
    ) -> Result<Response<Ack>, Status> {
        let peer = peer_subject(&request);
        let req = request.into_inner();

        if let Some(peer) = peer {
            if !req.agent_id.is_empty() && peer != req.agent_id {
                tracing::warn!(agent_id = %req.agent_id, cert_cn = %peer, "Profile report identity mismatch");
                return Err(into_status(CheckInError::IdentityMismatch {
                    claimed: req.agent_id,
                    peer,
                }));
            }
        }

        let ack = self
            .handler
            .report_profile(&req)
            .await
            .map_err(into_status)?;
        Ok(Response::new(ack))
    }
}

fn into_status(err: CheckInError) -> Status {
    match err {
        CheckInError::MissingIdentity
        | CheckInError::InvalidArgument(_)
        | CheckInError::InvalidCsr(_) => Status::invalid_argument(err.to_string()),
        CheckInError::InvalidToken(_) | CheckInError::IdentityMismatch { .. } => {
            Status::permission_denied(err.to_string())
        }
        CheckInError::AgentNotFound(_) => Status::not_found(err.to_string()),
        CheckInError::Storage(_) => {
            tracing::error!(error = %err, "Check-in failed");
            Status::internal("internal error")
        }
    }
}
