// Expense Tracker - REST API with Axum
// Handlers, shared state and error mapping; the binary in bin/server.rs only wires config

use axum::{
    extract::{
        multipart::MultipartRejection,
        rejection::{JsonRejection, PathRejection},
        Multipart, Path, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::analytics::{self, Anomaly, Forecast, Summary};
use crate::categorizer::{self, Categorizer};
use crate::csv_io::{self, ImportSummary};
use crate::db::{self, Expense, ExpensePayload};
use crate::error::{Result, TrackerError};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    db: Arc<Mutex<Connection>>,
    categorizer: Option<Arc<Categorizer>>,
}

impl AppState {
    pub fn new(conn: Connection, categorizer: Option<Categorizer>) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
            categorizer: categorizer.map(Arc::new),
        }
    }

    pub fn model_loaded(&self) -> bool {
        self.categorizer.is_some()
    }

    /// Run storage work while holding the connection; the guard drops on return
    fn with_db<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .db
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&conn)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize, Deserialize)]
pub struct MessageResponse {
    pub msg: String,
}

#[derive(Serialize, Deserialize)]
pub struct ImportResponse {
    pub imported: usize,
    pub skipped: usize,
    pub msg: String,
}

impl From<ImportSummary> for ImportResponse {
    fn from(summary: ImportSummary) -> Self {
        Self {
            imported: summary.imported,
            skipped: summary.skipped,
            msg: "CSV upload complete".to_string(),
        }
    }
}

#[derive(Deserialize)]
pub struct CategorizeRequest {
    #[serde(default)]
    pub title: String,
}

#[derive(Serialize, Deserialize)]
pub struct CategorizeResponse {
    pub category: String,
}

impl TrackerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TrackerError::NotFound(_) => StatusCode::NOT_FOUND,
            TrackerError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TrackerError::InvalidCsv(_) => StatusCode::BAD_REQUEST,
            TrackerError::ModelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            TrackerError::Model(_)
            | TrackerError::Config(_)
            | TrackerError::Storage(_)
            | TrackerError::Csv(_)
            | TrackerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TrackerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            debug!(error = %self, status = status.as_u16(), "request rejected");
        }

        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| TrackerError::Validation(rejection.body_text()))
}

fn path_param<T>(param: std::result::Result<Path<T>, PathRejection>) -> Result<T> {
    param
        .map(|Path(value)| value)
        .map_err(|rejection| TrackerError::Validation(rejection.body_text()))
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET / - Health check
async fn health_check() -> Json<MessageResponse> {
    Json(MessageResponse {
        msg: "Expense tracker backend is running".to_string(),
    })
}

/// GET /expenses - All expenses
async fn list_expenses(State(state): State<AppState>) -> Result<Json<Vec<Expense>>> {
    state.with_db(db::list_expenses).map(Json)
}

/// GET /expenses/:id - One expense
async fn get_expense(
    State(state): State<AppState>,
    id: std::result::Result<Path<i64>, PathRejection>,
) -> Result<Json<Expense>> {
    let id = path_param(id)?;
    state.with_db(|conn| db::get_expense(conn, id)).map(Json)
}

/// POST /expenses - Create an expense
async fn create_expense(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ExpensePayload>, JsonRejection>,
) -> Result<Json<Expense>> {
    let payload = json_body(payload)?;
    state
        .with_db(|conn| db::create_expense(conn, &payload))
        .map(Json)
}

/// PUT /expenses/:id - Overwrite title, amount and category
async fn update_expense(
    State(state): State<AppState>,
    id: std::result::Result<Path<i64>, PathRejection>,
    payload: std::result::Result<Json<ExpensePayload>, JsonRejection>,
) -> Result<Json<Expense>> {
    let id = path_param(id)?;
    let payload = json_body(payload)?;
    state
        .with_db(|conn| db::update_expense(conn, id, &payload))
        .map(Json)
}

/// DELETE /expenses/:id
async fn delete_expense(
    State(state): State<AppState>,
    id: std::result::Result<Path<i64>, PathRejection>,
) -> Result<Json<MessageResponse>> {
    let id = path_param(id)?;
    state.with_db(|conn| db::delete_expense(conn, id))?;
    Ok(Json(MessageResponse {
        msg: "Deleted successfully".to_string(),
    }))
}

/// GET /export-csv - Download every expense as CSV
async fn export_csv(State(state): State<AppState>) -> Result<Response> {
    let bytes = state.with_db(csv_io::export_csv)?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=expenses.csv",
            ),
        ],
        bytes,
    )
        .into_response())
}

/// POST /upload-csv - Multipart upload, field "file"
async fn upload_csv(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<ImportResponse>> {
    let mut multipart =
        multipart.map_err(|rejection| TrackerError::Validation(rejection.body_text()))?;

    let mut contents = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| TrackerError::Validation(e.to_string()))?
    {
        if field.name() == Some("file") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| TrackerError::Validation(e.to_string()))?;
            contents = Some(bytes);
            break;
        }
    }

    let contents = contents
        .ok_or_else(|| TrackerError::Validation("multipart field 'file' is required".into()))?;

    let summary = state.with_db(|conn| csv_io::import_csv(conn, &contents))?;
    Ok(Json(summary.into()))
}

/// POST /smart-categorize - Predict a category from a title
async fn smart_categorize(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CategorizeRequest>, JsonRejection>,
) -> Result<Json<CategorizeResponse>> {
    let request = json_body(payload)?;
    let category = categorizer::categorize(state.categorizer.as_deref(), &request.title)?;
    Ok(Json(CategorizeResponse { category }))
}

/// GET /detect-anomalies
async fn detect_anomalies(State(state): State<AppState>) -> Result<Json<Vec<Anomaly>>> {
    let expenses = state.with_db(db::list_expenses)?;
    Ok(Json(analytics::detect_anomalies(&expenses)))
}

/// GET /forecast-expense/:category
async fn forecast_expense(
    State(state): State<AppState>,
    category: std::result::Result<Path<String>, PathRejection>,
) -> Result<Json<Forecast>> {
    let category = path_param(category)?;
    let expenses = state.with_db(|conn| db::list_expenses_by_category(conn, &category))?;
    Ok(Json(Forecast {
        forecast: analytics::forecast_next_month(&expenses),
    }))
}

/// GET /personalized-summary
async fn personalized_summary(State(state): State<AppState>) -> Result<Json<Summary>> {
    let expenses = state.with_db(db::list_expenses)?;
    Ok(Json(analytics::personalized_summary(&expenses)))
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: AppState) -> Router {
    info!(model_loaded = state.model_loaded(), "building router");

    Router::new()
        .route("/", get(health_check))
        .route("/expenses", get(list_expenses).post(create_expense))
        .route(
            "/expenses/:id",
            put(update_expense).delete(delete_expense).get(get_expense),
        )
        .route("/export-csv", get(export_csv))
        .route("/upload-csv", post(upload_csv))
        .route("/smart-categorize", post(smart_categorize))
        .route("/detect-anomalies", get(detect_anomalies))
        .route("/forecast-expense/:category", get(forecast_expense))
        .route("/personalized-summary", get(personalized_summary))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categorizer::tests::sample_model;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_app(model: Option<Categorizer>) -> Router {
        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        router(AppState::new(conn, model))
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn send_json(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(b) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let (status, bytes) = send(app, req).await;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn multipart_request(field: &str, csv: &str) -> Request<Body> {
        let boundary = "XBOUNDARYX";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"{f}\"; filename=\"expenses.csv\"\r\n\
             Content-Type: text/csv\r\n\r\n{csv}\r\n--{b}--\r\n",
            b = boundary,
            f = field,
            csv = csv
        );
        Request::builder()
            .method(Method::POST)
            .uri("/upload-csv")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app(None);
        let (status, body) = send_json(&app, Method::GET, "/", None).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body["msg"].as_str().unwrap().contains("running"));
    }

    #[tokio::test]
    async fn test_crud_flow() {
        let app = test_app(None);

        let (status, created) = send_json(
            &app,
            Method::POST,
            "/expenses",
            Some(json!({"title": "Coffee", "amount": 4.5, "category": "Food"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id = created["id"].as_i64().unwrap();
        assert!(created["created_at"].is_string());

        let (_, list) = send_json(&app, Method::GET, "/expenses", None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0], created);

        let (status, updated) = send_json(
            &app,
            Method::PUT,
            &format!("/expenses/{}", id),
            Some(json!({"title": "Latte", "amount": "5.25", "category": "Food"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["title"], "Latte");
        assert_eq!(updated["amount"], 5.25);
        assert_eq!(updated["created_at"], created["created_at"]);

        let (status, body) =
            send_json(&app, Method::DELETE, &format!("/expenses/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["msg"], "Deleted successfully");

        let (status, _) =
            send_json(&app, Method::DELETE, &format!("/expenses/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send_json(
            &app,
            Method::PUT,
            &format!("/expenses/{}", id),
            Some(json!({"title": "x", "amount": 1, "category": "y"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));

        let (status, _) = send_json(&app, Method::GET, &format!("/expenses/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_non_integer_id_is_json_validation_error() {
        let app = test_app(None);

        let (status, body) = send_json(
            &app,
            Method::PUT,
            "/expenses/abc",
            Some(json!({"title": "x", "amount": 1, "category": "y"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].is_string());

        for method in [Method::GET, Method::DELETE] {
            let (status, body) = send_json(&app, method, "/expenses/1.5", None).await;
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
            assert!(body["error"].as_str().unwrap().contains("1.5"));
        }
    }

    #[tokio::test]
    async fn test_create_validation_errors() {
        let app = test_app(None);

        let (status, _) = send_json(
            &app,
            Method::POST,
            "/expenses",
            Some(json!({"title": "Coffee", "amount": "cheap", "category": "Food"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = send_json(
            &app,
            Method::POST,
            "/expenses",
            Some(json!({"title": "Coffee"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (_, list) = send_json(&app, Method::GET, "/expenses", None).await;
        assert!(list.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_csv_export_and_upload() {
        let app = test_app(None);
        send_json(
            &app,
            Method::POST,
            "/expenses",
            Some(json!({"title": "Rent", "amount": 900, "category": "Housing"})),
        )
        .await;

        let req = Request::builder()
            .uri("/export-csv")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/csv");
        assert!(resp.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("expenses.csv"));
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.starts_with("ID,Title,Amount,Category,Created_At\n"));
        assert!(text.contains("Rent"));

        let (status, bytes) = send(
            &app,
            multipart_request("file", "title,amount,category\nBus,2.5,Transport\nFree,0,Misc"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["imported"], 1);
        assert_eq!(body["skipped"], 1);

        let (_, list) = send_json(&app, Method::GET, "/expenses", None).await;
        assert_eq!(list.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_upload_bad_amount_is_client_error() {
        let app = test_app(None);

        let (status, bytes) = send(
            &app,
            multipart_request("file", "Title,Amount,Category\nA,1,X\nB,abc,X"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["error"].as_str().unwrap().contains("abc"));

        let (status, _) = send(&app, multipart_request("upload", "Title,Amount,Category\n")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (_, list) = send_json(&app, Method::GET, "/expenses", None).await;
        assert!(list.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_smart_categorize() {
        let app = test_app(None);
        let (status, _) = send_json(
            &app,
            Method::POST,
            "/smart-categorize",
            Some(json!({"title": "coffee"})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let app = test_app(Some(sample_model()));
        let (status, body) = send_json(
            &app,
            Method::POST,
            "/smart-categorize",
            Some(json!({"title": "Uber downtown"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["category"], "Transport");
    }

    #[tokio::test]
    async fn test_analytics_endpoints() {
        let app = test_app(None);

        let (_, summary) = send_json(&app, Method::GET, "/personalized-summary", None).await;
        assert_eq!(
            summary,
            json!({"total_spent": 0.0, "top_category": "", "top_category_amount": 0.0})
        );

        let (_, anomalies) = send_json(&app, Method::GET, "/detect-anomalies", None).await;
        assert_eq!(anomalies, json!([]));

        for amount in [10, 10, 10, 10, 1000] {
            send_json(
                &app,
                Method::POST,
                "/expenses",
                Some(json!({"title": "item", "amount": amount, "category": "Misc"})),
            )
            .await;
        }
        for (month, amount) in [("2024-01-15T00:00:00Z", 100), ("2024-02-15T00:00:00Z", 200)] {
            send_json(
                &app,
                Method::POST,
                "/expenses",
                Some(json!({
                    "title": "Groceries",
                    "amount": amount,
                    "category": "Food & Drink",
                    "created_at": month
                })),
            )
            .await;
        }

        let (_, anomalies) = send_json(&app, Method::GET, "/detect-anomalies", None).await;
        let flagged: Vec<f64> = anomalies
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["amount"].as_f64().unwrap())
            .collect();
        assert!(flagged.contains(&1000.0));

        let (status, forecast) =
            send_json(&app, Method::GET, "/forecast-expense/Food%20%26%20Drink", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(forecast["forecast"], 300.0);

        let (_, forecast) = send_json(&app, Method::GET, "/forecast-expense/Unknown", None).await;
        assert_eq!(forecast["forecast"], 0.0);

        let (_, summary) = send_json(&app, Method::GET, "/personalized-summary", None).await;
        assert_eq!(summary["total_spent"], 1340.0);
        assert_eq!(summary["top_category"], "Misc");
        assert_eq!(summary["top_category_amount"], 1040.0);
    }
}
