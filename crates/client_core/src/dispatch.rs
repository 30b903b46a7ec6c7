use std::sync::Arc;

use serde_json::Value;
use shared::protocol::{DecryptedBody, ResponseEnvelope};
use tracing::{debug, info, warn};

use crate::{
    crypto::{KeyMaterial, Params, Signer},
    envelope::{decrypt_json, encrypt, EncryptedEnvelope},
    error::ClientError,
    operations::{OperationSpec, SessionField},
    session::{Session, SessionCell},
    transport::{join_path, HttpMethod, HttpRequest, Transport},
};

/// Runs declared operations against a bootstrapped session.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<Transport>,
    signer: Signer,
}

impl Dispatcher {
    pub fn new(transport: Arc<Transport>, signer: Signer) -> Self {
        Self { transport, signer }
    }

    pub async fn dispatch(
        &self,
        session: &Session,
        spec: &OperationSpec,
        args: Params,
    ) -> Result<Value, ClientError> {
        let key = session.require_key()?;
        let params = build_params(session, spec, args)?;
        let signature = self.signer.sign(spec.name, &params, spec.required_args)?;
        let envelope = encrypt(key, &params.to_json_string())?;

        let endpoints = session.service_endpoints().get(spec.service).ok_or_else(|| {
            ClientError::Protocol(format!(
                "operation `{}` targets unknown service `{}`",
                spec.name, spec.service
            ))
        })?;

        let mut last_error = None;
        for (index, base) in endpoints.iter().enumerate() {
            let url = join_path(base, spec.path)?;
            let mut request = match spec.method {
                HttpMethod::Get => HttpRequest::get(url).with_query("params", &envelope.ciphertext),
                HttpMethod::Post => HttpRequest::post(url).with_form("params", &envelope.ciphertext),
            };
            request = request
                .with_headers(session.credentials().identity_headers())
                .with_query("type", session.client_type())
                .with_query("client_version", session.protocol_version())
                .with_query("enc_ver", envelope.encoding_version.as_u8())
                .with_query("signkey", signature.as_str());

            debug!(
                operation = spec.name,
                service = spec.service,
                endpoint = index,
                "dispatch: sending operation"
            );
            match self.transport.send(&request).await {
                Ok(body) => return decode_response(key, spec, body, &envelope),
                Err(err) if err.is_retryable() => {
                    warn!(
                        operation = spec.name,
                        endpoint = %base,
                        error = %err,
                        "dispatch: endpoint unreachable, failing over"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ClientError::Protocol(format!("service `{}` has no endpoints", spec.service))
        }))
    }

    /// Dispatches with whatever session is current when the call starts.
    pub async fn dispatch_current(
        &self,
        cell: &SessionCell,
        spec: &OperationSpec,
        args: Params,
    ) -> Result<Value, ClientError> {
        let session = cell.current();
        self.dispatch(&session, spec, args).await
    }

    /// Dispatches only if `session` has not been superseded.
    pub async fn dispatch_checked(
        &self,
        cell: &SessionCell,
        session: &Session,
        spec: &OperationSpec,
        args: Params,
    ) -> Result<Value, ClientError> {
        cell.ensure_current(session)?;
        self.dispatch(session, spec, args).await
    }
}

/// Caller args plus the session fields `spec` asks for. Args may not shadow
/// session fields.
pub fn build_params(session: &Session, spec: &OperationSpec, args: Params) -> Result<Params, ClientError> {
    let mut params = args;
    for field in spec.session_fields {
        let value = match field {
            SessionField::DeviceId => session.credentials().device_id.clone(),
            SessionField::Language => session.credentials().language_tag.clone(),
            SessionField::Identity => session.identity().as_str().to_string(),
        };
        params.insert(field.param_name(), value)?;
    }
    if let Some(missing) = spec.required_args.iter().find(|arg| !params.contains_key(arg)) {
        return Err(ClientError::Protocol(format!(
            "operation `{}` is missing required argument `{missing}`",
            spec.name
        )));
    }
    Ok(params)
}

fn decode_response(
    key: &KeyMaterial,
    spec: &OperationSpec,
    body: Value,
    request_envelope: &EncryptedEnvelope,
) -> Result<Value, ClientError> {
    let response: ResponseEnvelope = serde_json::from_value(body)
        .map_err(|err| ClientError::Protocol(format!("unexpected response shape: {err}")))?;
    let data = response.into_result()?;

    let ciphertext = match data {
        None => return Ok(Value::Null),
        Some(Value::String(ciphertext)) => ciphertext,
        Some(_) => {
            return Err(ClientError::Protocol(format!(
                "operation `{}` returned unencrypted data",
                spec.name
            )))
        }
    };

    let decrypted: DecryptedBody = decrypt_json(
        key,
        &EncryptedEnvelope::new(ciphertext, request_envelope.encoding_version),
    )?;
    if let Some(error) = decrypted.error {
        info!(
            operation = spec.name,
            code = error.code,
            "dispatch: server rejected operation"
        );
        return Err(error.into());
    }
    Ok(decrypted.data.unwrap_or(Value::Null))
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
