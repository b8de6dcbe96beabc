//! Command and query submission.
//!
//! The retry ladder, per failure class:
//! - timeout, missing leader, transport drop: retry with the same request
//!   number (the server's response cache makes the retry idempotent) after
//!   forgetting the cached leader;
//! - unknown session: re-register transparently and re-issue under the new
//!   session;
//! - anything else: surface to the caller.

use crate::client::runtime::SessionClient;
use crate::core::error::{TrellisError, TrellisResult};
use crate::rpc::{ClientRequest, ClientResponse, CommandRequest, QueryConsistency, QueryRequest};
use bytes::Bytes;

impl SessionClient {
    /// Submit a command: a state-mutating operation applied exactly once
    /// per session.
    pub async fn submit_command(&self, payload: Bytes) -> TrellisResult<Bytes> {
        if !self.is_open() {
            return Err(TrellisError::Closed);
        }
        if self.session_id() == 0 {
            self.register().await?;
        }

        let mut request_no = self.inner.state.lock().next_request_no();
        loop {
            if self.is_shut_down() {
                return Err(TrellisError::Closed);
            }

            let (session_id, response_ack) = {
                let state = self.inner.state.lock();
                (state.session_id, state.response)
            };
            let member = self
                .inner
                .membership
                .lock()
                .select_for_command(&mut rand::thread_rng())
                .ok_or(TrellisError::NoLeader)?;

            let request = ClientRequest::Command(CommandRequest {
                session_id,
                request_no,
                response_ack,
                payload: payload.clone(),
            });
            let outcome = match self.request_via(&member, request).await {
                Ok(ClientResponse::Command(resp)) => match resp.error {
                    None => Ok((resp.result, resp.version)),
                    Some(err) => Err(TrellisError::from(err)),
                },
                Ok(_) => Err(TrellisError::protocol("mismatched command response")),
                Err(err) => Err(err),
            };

            match outcome {
                Ok((result, version)) => {
                    let mut state = self.inner.state.lock();
                    state.acknowledge(request_no);
                    state.observe_version(version);
                    return Ok(result);
                }
                Err(err) if err.is_retriable() => {
                    tracing::warn!(
                        member = member.id,
                        request = request_no,
                        error = %err,
                        "command attempt failed, retrying"
                    );
                    self.inner.membership.lock().clear_leader();
                    tokio::time::sleep(self.inner.config.backoff_min()).await;
                }
                Err(err) if err.requires_reregister() => {
                    tracing::warn!(session = session_id, "lost session, re-registering");
                    self.inner.state.lock().reset();
                    self.register().await?;
                    request_no = self.inner.state.lock().next_request_no();
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Submit a query: a read-only operation answered from state no older
    /// than the client's version watermark.
    pub async fn submit_query(
        &self,
        payload: Bytes,
        consistency: QueryConsistency,
    ) -> TrellisResult<Bytes> {
        if !self.is_open() {
            return Err(TrellisError::Closed);
        }
        if self.session_id() == 0 {
            self.register().await?;
        }

        loop {
            if self.is_shut_down() {
                return Err(TrellisError::Closed);
            }

            let (session_id, version) = {
                let state = self.inner.state.lock();
                (state.session_id, state.version)
            };
            let member = self
                .inner
                .membership
                .lock()
                .select_for_query(consistency, &mut rand::thread_rng())
                .ok_or(TrellisError::NoLeader)?;

            let request = ClientRequest::Query(QueryRequest {
                session_id,
                version,
                consistency,
                payload: payload.clone(),
            });
            let outcome = match self.request_via(&member, request).await {
                Ok(ClientResponse::Query(resp)) => match resp.error {
                    None => Ok((resp.result, resp.version)),
                    Some(err) => Err(TrellisError::from(err)),
                },
                Ok(_) => Err(TrellisError::protocol("mismatched query response")),
                Err(err) => Err(err),
            };

            match outcome {
                Ok((result, version)) => {
                    self.inner.state.lock().observe_version(version);
                    return Ok(result);
                }
                // Queries carry no side effects and may be re-issued freely.
                Err(err) if err.is_retriable() => {
                    tracing::warn!(
                        member = member.id,
                        error = %err,
                        "query attempt failed, retrying"
                    );
                    self.inner.membership.lock().clear_leader();
                    tokio::time::sleep(self.inner.config.backoff_min()).await;
                }
                Err(err) if err.requires_reregister() => {
                    tracing::warn!(session = session_id, "lost session, re-registering");
                    self.inner.state.lock().reset();
                    self.register().await?;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
