use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn validate_instant(t: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_details(details: &BookingDetails) -> Result<(), EngineError> {
    let name = details.customer_name.trim();
    if name.is_empty() {
        return Err(EngineError::InvalidDetails("customer name is required"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("customer name too long"));
    }
    let email = details.customer_email.trim();
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("customer email too long"));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {}
        _ => return Err(EngineError::InvalidDetails("customer email is malformed")),
    }
    if let Some(client_ref) = &details.client_ref {
        if client_ref.is_empty() {
            return Err(EngineError::InvalidDetails("client reference is empty"));
        }
        if client_ref.len() > MAX_CLIENT_REF_LEN {
            return Err(EngineError::LimitExceeded("client reference too long"));
        }
    }
    if let Some(metadata) = &details.metadata {
        if metadata.len() > MAX_METADATA_LEN {
            return Err(EngineError::LimitExceeded("metadata too large"));
        }
        match serde_json::from_str::<serde_json::Value>(metadata) {
            Ok(v) if v.is_object() => {}
            _ => return Err(EngineError::InvalidDetails("metadata must be a JSON object")),
        }
    }
    Ok(())
}
