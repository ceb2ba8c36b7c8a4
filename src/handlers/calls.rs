use crate::auth::user_id_from_headers;
use crate::error::AppError;
use crate::services::StoreError;
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct FirstCallRequest {
    pub character_id: i64,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Greeting spoken when the user opens a call, before any audio is exchanged.
pub async fn first_call(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<FirstCallRequest>,
) -> Result<HttpResponse, AppError> {
    let user_id = user_id_from_headers(&req)?;
    let body = body.into_inner();

    let character = state
        .services
        .characters
        .load_character(body.character_id)
        .await
        .map_err(|err| match err {
            StoreError::NotFound(_) => AppError::NotFound(err.to_string()),
            StoreError::Unavailable(_) => AppError::Internal(err.to_string()),
        })?;
    let persona = state.services.personas.resolve(&character);

    let audio = state
        .services
        .synthesizer
        .synthesize(&persona.greeting, &persona.voice)
        .await
        .map_err(|err| AppError::Upstream(format!("speech synthesis failed: {}", err)))?;

    let session_id = body
        .session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    state.metrics.greeting_served();
    info!(user_id, character_id = character.id, session_id = %session_id, bytes = audio.len(), "Greeting served");

    Ok(HttpResponse::Ok().json(json!({
        "text_response": persona.greeting,
        "audio_response": STANDARD.encode(&audio),
        "session_id": session_id,
        "character_id": character.id,
        "character_name": persona.name,
    })))
}

pub async fn session_status(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let session = state
        .services
        .registry
        .get(&session_id)
        .ok_or_else(|| AppError::NotFound(format!("session {} not found", session_id)))?;

    Ok(HttpResponse::Ok().json(session.snapshot()))
}
