use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let counters = state.metrics.snapshot();
    let active_sessions = state.services.registry.active_count();
    let capacity = state.services.registry.capacity();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": state.config.server.host,
            "port": state.config.server.port
        },
        "sessions": {
            "active": active_sessions,
            "connected": state.services.hub.connection_count(),
            "capacity": capacity,
            "load": load_status(active_sessions, capacity)
        },
        "calls": {
            "started": counters.calls_started,
            "stopped": counters.calls_stopped,
            "greetings_served": counters.greetings_served
        },
        "turns": {
            "started": counters.turns_started,
            "rejected": counters.turns_rejected,
            "delivered": counters.turns_delivered,
            "fallback": counters.fallback_turns,
            "failed": counters.failed_turns
        }
    }))
}

fn load_status(active: usize, capacity: usize) -> &'static str {
    let usage = if capacity > 0 {
        active as f64 / capacity as f64
    } else {
        0.0
    };

    if usage > 0.9 {
        "high_load"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    }
}
