//! Request construction for the handler/service endpoint pair.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::SourceConfig;
use crate::error::{AcquireError, AcquireResult};
use crate::session::SessionContext;
use crate::transport::{HttpResponse, SourceTransport};
use crate::types::QueryKey;

const FIELD_START_DATE: &str = "ctl00$ContentPlaceHolder1$txtSDATE";
const FIELD_END_DATE: &str = "ctl00$ContentPlaceHolder1$txtEDATE";
const FIELD_ANIMAL: &str = "ctl00$ContentPlaceHolder1$ddlAnimal";
const FIELD_QUERY_BUTTON: &str = "ctl00$ContentPlaceHolder1$btnQuery";
const QUERY_BUTTON_LABEL: &str = "查詢";

/// Which endpoint (and request encoding) to query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryShape {
    /// Form-encoded POST to the handler endpoint.
    #[default]
    Form,
    /// JSON POST to the service endpoint.
    Service,
}

/// Form body for a handler query: session state first, then the query fields.
pub fn form_fields(session: &SessionContext, key: &QueryKey) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = session
        .form_state()
        .iter()
        .filter(|(name, _)| {
            !matches!(
                name.as_str(),
                FIELD_START_DATE | FIELD_END_DATE | FIELD_ANIMAL | FIELD_QUERY_BUTTON
            )
        })
        .cloned()
        .collect();
    fields.push((FIELD_START_DATE.to_string(), key.start_param()));
    fields.push((FIELD_END_DATE.to_string(), key.end_param()));
    fields.push((
        FIELD_ANIMAL.to_string(),
        key.category.source_code().to_string(),
    ));
    fields.push((
        FIELD_QUERY_BUTTON.to_string(),
        QUERY_BUTTON_LABEL.to_string(),
    ));
    fields
}

/// JSON body for a service query.
pub fn service_body(key: &QueryKey) -> serde_json::Value {
    json!({
        "SDATE": key.start_param(),
        "EDATE": key.end_param(),
        "Animal": key.category.source_code(),
    })
}

/// Issue one query and screen the response status.
///
/// Returns the response only when it is 2xx with a non-blank body.
pub async fn send_query<T: SourceTransport + ?Sized>(
    transport: &T,
    source: &SourceConfig,
    session: &SessionContext,
    key: &QueryKey,
) -> AcquireResult<HttpResponse> {
    let headers = session.request_headers(&source.entry_page);
    let resp = match source.query_shape {
        QueryShape::Form => {
            let fields = form_fields(session, key);
            transport
                .post_form(&source.handler_endpoint, &fields, &headers)
                .await?
        }
        QueryShape::Service => {
            let body = service_body(key);
            transport
                .post_json(&source.service_endpoint, &body, &headers)
                .await?
        }
    };
    screen(resp)
}

/// Map status and blank bodies onto the error taxonomy.
pub fn screen(resp: HttpResponse) -> AcquireResult<HttpResponse> {
    if let Some(err) = AcquireError::from_status(resp.status) {
        return Err(err);
    }
    if resp.body.trim().is_empty() {
        return Err(AcquireError::EmptyPayload);
    }
    Ok(resp)
}
