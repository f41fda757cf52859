use crate::{
    conversation::{
        conversation_dto::{
            AddParticipantRequest, CreateDirectRequest, CreateGroupRequest, UpdateGroupRequest,
        },
        conversation_handlers,
        conversation_models::Conversation,
    },
    message::{
        message_dto::{ConversationSummary, MarkConversationReadResponse, SendMessageRequest},
        message_handlers,
        message_models::{Attachment, MessageKind, MessageResponse},
    },
    middleware::auth_middleware,
    state::AppState,
};
use axum::http::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    HeaderValue, Method,
};
use axum::{
    middleware,
    routing::{delete, get, patch, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::conversation::conversation_handlers::create_direct,
        crate::conversation::conversation_handlers::create_group,
        crate::conversation::conversation_handlers::list_conversations,
        crate::conversation::conversation_handlers::get_conversation,
        crate::conversation::conversation_handlers::update_group,
        crate::conversation::conversation_handlers::add_participant,
        crate::conversation::conversation_handlers::remove_participant,
        crate::message::message_handlers::send_message,
        crate::message::message_handlers::get_messages,
        crate::message::message_handlers::mark_message_read,
        crate::message::message_handlers::mark_conversation_read,
        crate::message::message_handlers::delete_message,
    ),
    components(
        schemas(
            CreateDirectRequest,
            CreateGroupRequest,
            UpdateGroupRequest,
            AddParticipantRequest,
            Conversation,
            ConversationSummary,
            SendMessageRequest,
            MarkConversationReadResponse,
            Attachment,
            MessageKind,
            MessageResponse,
        )
    ),
    tags(
        (name = "conversations", description = "Direct and group conversations"),
        (name = "messages", description = "Message history, sending and read receipts")
    ),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::Http::new(
                        utoipa::openapi::security::HttpAuthScheme::Bearer,
                    ),
                ),
            )
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let origins: Vec<HeaderValue> = state
        .config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin {}", origin);
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true);

    let conversation_routes = Router::new()
        .route("/", get(conversation_handlers::list_conversations))
        .route("/direct", post(conversation_handlers::create_direct))
        .route("/groups", post(conversation_handlers::create_group))
        .route(
            "/:id",
            get(conversation_handlers::get_conversation).patch(conversation_handlers::update_group),
        )
        .route("/:id/participants", post(conversation_handlers::add_participant))
        .route(
            "/:id/participants/:user_id",
            delete(conversation_handlers::remove_participant),
        )
        .route(
            "/:id/messages",
            get(message_handlers::get_messages).post(message_handlers::send_message),
        )
        .route("/:id/read", post(message_handlers::mark_conversation_read))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let message_routes = Router::new()
        .route("/:id", delete(message_handlers::delete_message))
        .route("/:id/read", patch(message_handlers::mark_message_read))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // WebSocket route
    let ws_routes = Router::new()
        .route("/ws", get(crate::websocket::ws_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let api_routes = Router::new()
        .nest("/conversations", conversation_routes)
        .nest("/messages", message_routes)
        .merge(ws_routes);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::create_jwt;
    use crate::identity::Role;
    use crate::state::Config;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        response::Response,
    };
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    const SECRET: &str = "router-test-secret";

    fn app() -> Router {
        create_router(AppState::in_memory(Arc::new(Config::new(SECRET))))
    }

    fn token(user_id: Uuid) -> String {
        create_jwt(user_id, Role::User, SECRET, 1).unwrap()
    }

    async fn call(app: &Router, method: &str, uri: &str, user: Option<Uuid>, body: Option<Value>) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user_id) = user {
            builder = builder.header("Authorization", format!("Bearer {}", token(user_id)));
        }
        let request = match body {
            Some(json) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.clone().oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_requires_token() {
        let app = app();
        let response = call(&app, "GET", "/api/conversations", None, None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = Request::builder()
            .uri("/api/conversations")
            .header("Authorization", "Bearer not-a-token")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(response).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_conversation_and_message_flow() {
        let app = app();
        let (a, b, outsider) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let response = call(&app, "POST", "/api/conversations/direct", Some(a), Some(json!({ "user_id": b }))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let conversation = json_body(response).await;
        let conversation_id = conversation["id"].as_str().unwrap().to_string();

        // same pair from the other side
        let response = call(&app, "POST", "/api/conversations/direct", Some(b), Some(json!({ "user_id": a }))).await;
        assert_eq!(json_body(response).await["id"], conversation["id"]);

        let uri = format!("/api/conversations/{}/messages", conversation_id);
        let response = call(&app, "POST", &uri, Some(a), Some(json!({ "type": "text", "content": "hi" }))).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let message = json_body(response).await;
        assert_eq!(message["seq"], 1);
        assert_eq!(message["type"], "text");

        let response = call(&app, "POST", &uri, Some(a), Some(json!({ "type": "image" }))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = call(&app, "GET", &uri, Some(outsider), None).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = call(&app, "GET", &format!("{}?limit=10", uri), Some(b), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let page = json_body(response).await;
        assert_eq!(page.as_array().map(Vec::len), Some(1));

        let read_uri = format!("/api/messages/{}/read", message["id"].as_str().unwrap());
        let response = call(&app, "PATCH", &read_uri, Some(b), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["read_by"], json!([b]));

        let response = call(&app, "GET", "/api/conversations", Some(b), None).await;
        let summaries = json_body(response).await;
        assert_eq!(summaries[0]["unread_count"], 0);
        assert_eq!(summaries[0]["last_message"]["content"], "hi");
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_not_found() {
        let app = app();
        let uri = format!("/api/conversations/{}/messages", Uuid::new_v4());
        let response = call(&app, "POST", &uri, Some(Uuid::new_v4()), Some(json!({ "content": "hello" }))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_openapi_conversation_responses_reference_schemas() {
        let doc = serde_json::to_value(ApiDoc::openapi()).unwrap();
        let schema = |path: &str, method: &str, status: &str| {
            doc["paths"][path][method]["responses"][status]["content"]["application/json"]["schema"]
                .clone()
        };

        assert_eq!(
            schema("/api/conversations/direct", "post", "200")["$ref"].as_str(),
            Some("#/components/schemas/Conversation")
        );
        assert_eq!(
            schema("/api/conversations", "get", "200")["items"]["$ref"].as_str(),
            Some("#/components/schemas/ConversationSummary")
        );
        assert!(doc["components"]["schemas"]["Conversation"].is_object());
    }
}
