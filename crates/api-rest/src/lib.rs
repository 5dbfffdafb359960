//! # API REST
//!
//! FHIR REST API for the IDMP registry.
//!
//! Handles:
//! - HTTP endpoints with axum
//! - OpenAPI/Swagger documentation
//! - REST-specific concerns (FHIR JSON bodies, `OperationOutcome` errors, CORS)
//!
//! ## Routes
//!
//! ```text
//! GET    /health
//! GET    /metadata
//! GET    /fhir/{type}                      searchset Bundle
//! POST   /fhir/{type}                      create
//! POST   /fhir/$idmp-transform             Medication -> MedicinalProduct
//! GET    /fhir/{type}/{id}                 read
//! GET    /fhir/MedicinalProduct/$lookup    lookup by ATC code or MPID
//! PUT    /fhir/{type}/{id}                 update
//! DELETE /fhir/{type}/{id}                 delete
//! ```
//!
//! Operations (`$name` segments) share their paths with the type and id routes and are
//! dispatched inside the handlers.

#![warn(rust_2018_idioms)]

mod outcome;
mod search;

pub use outcome::{ApiError, FhirJson, FHIR_JSON};

use axum::{
    body::Bytes,
    extract::{Path, Query as QueryParams, RawQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use fhir::{Bundle, BundleEntry, CapabilityStatement, MedicationTransform, SearchSet};
use idmp_core::constants::SOFTWARE_NAME;
use idmp_core::definitions::{
    capability_resources, folder_for, ATC_SYSTEM, MEDICINAL_PRODUCT, MPID_SYSTEM,
};
use idmp_core::store::Clause;
use idmp_core::{
    CoreConfig, FhirMapper, FieldMap, FieldValue, IdmpError, IdmpResult, NewResource, Query,
    ResourceInstance, ResourceStore,
};
use idmp_types::ResourceKey;
use idmp_uuid::ResourceId;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

/// Application state for the REST API server
///
/// Shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<CoreConfig>,
    pub store: Arc<ResourceStore>,
}

impl AppState {
    pub fn new(store: Arc<ResourceStore>) -> Self {
        Self {
            cfg: store.config().clone(),
            store,
        }
    }

    fn mapper(&self) -> FhirMapper<'_> {
        FhirMapper::new(self.store.registry()).with_max_tree_depth(self.cfg.max_tree_depth())
    }

    fn render(&self, instance: &ResourceInstance) -> IdmpResult<Value> {
        self.mapper().to_document(instance)
    }
}

#[derive(Serialize, ToSchema)]
pub struct HealthRes {
    pub ok: bool,
    pub message: String,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        metadata,
        search_type,
        create_or_operate,
        read_or_operate,
        operate_on_instance,
        update_resource,
        delete_resource,
    ),
    components(schemas(HealthRes))
)]
struct ApiDoc;

/// Build the API router over `state`, Swagger UI included.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metadata", get(metadata))
        .route(
            "/fhir/:resource_type",
            get(search_type).post(create_or_operate),
        )
        .route(
            "/fhir/:resource_type/:id",
            get(read_or_operate)
                .post(operate_on_instance)
                .put(update_resource)
                .delete(delete_resource),
        )
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint for the REST API
///
/// Used for monitoring and load balancer health checks.
async fn health(State(_state): State<AppState>) -> Json<HealthRes> {
    Json(HealthRes {
        ok: true,
        message: "IDMP REST API is alive".into(),
    })
}

#[utoipa::path(
    get,
    path = "/metadata",
    responses(
        (status = 200, description = "CapabilityStatement"),
        (status = 500, description = "Internal server error")
    )
)]
/// Capability statement listing every registered type and its search parameters.
async fn metadata(State(state): State<AppState>) -> Result<FhirJson, ApiError> {
    let resources = capability_resources(state.store.registry())?;
    Ok(FhirJson(
        StatusCode::OK,
        CapabilityStatement::render(SOFTWARE_NAME, &resources),
    ))
}

#[utoipa::path(
    get,
    path = "/fhir/{resource_type}",
    params(
        ("resource_type" = String, Path, description = "Registered resource type"),
        ("_count" = Option<usize>, Query, description = "Page size"),
        ("_offset" = Option<usize>, Query, description = "Matches to skip"),
        ("_sort" = Option<String>, Query, description = "Sort parameter, `-` prefix for descending")
    ),
    responses(
        (status = 200, description = "searchset Bundle"),
        (status = 400, description = "Invalid search parameter"),
        (status = 404, description = "Unknown resource type")
    )
)]
/// Search instances of a type.
///
/// Every query parameter not starting with `_` is a search parameter: the type's declared
/// parameters first, otherwise equality on the field of that name.
async fn search_type(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    QueryParams(params): QueryParams<Vec<(String, String)>>,
    RawQuery(raw): RawQuery,
) -> Result<FhirJson, ApiError> {
    let request = search::SearchRequest::parse(&resource_type, &params, &state.cfg)?;
    let page = state.store.query(&resource_type, &request.query)?;

    let entries = page
        .items
        .iter()
        .map(|instance| {
            Ok(BundleEntry {
                full_url: resource_url(instance),
                resource: state.render(instance)?,
            })
        })
        .collect::<IdmpResult<Vec<_>>>()?;
    let links = search::PageLinks::new(&resource_type, raw.as_deref(), &request, page.total);

    Ok(FhirJson(
        StatusCode::OK,
        Bundle::searchset(&SearchSet {
            total: page.total,
            entries,
            self_link: Some(links.self_link),
            next_link: links.next,
            previous_link: links.previous,
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/fhir/{resource_type}",
    params(
        ("resource_type" = String, Path, description = "Resource type, or `$idmp-transform`")
    ),
    request_body(content = String, description = "FHIR resource"),
    responses(
        (status = 201, description = "Created"),
        (status = 200, description = "Transformed MedicinalProduct"),
        (status = 400, description = "Validation failed"),
        (status = 404, description = "Unknown resource type"),
        (status = 409, description = "Duplicate key or unique value")
    )
)]
/// Create a resource, or run the `$idmp-transform` operation.
async fn create_or_operate(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let document = parse_body(&body)?;
    if resource_type == "$idmp-transform" {
        let product = MedicationTransform::to_medicinal_product(&document)?;
        return Ok(FhirJson(StatusCode::OK, product).into_response());
    }
    if let Some(operation) = resource_type.strip_prefix('$') {
        return Err(unknown_operation(operation).into());
    }

    let fields = state.mapper().from_document(&checked_type(&document, &resource_type)?)?;
    let key = new_key(&fields)?;
    let created = state.store.create(
        NewResource::new(resource_type.as_str(), folder_for(&resource_type)?, key)
            .with_fields(fields),
    )?;
    tracing::info!(resource_type = %created.resource_type, id = %created.id, "created via REST");

    let location = resource_url(&created);
    let mut response = FhirJson(StatusCode::CREATED, state.render(&created)?).into_response();
    if let Ok(value) = location.parse() {
        response.headers_mut().insert(header::LOCATION, value);
    }
    Ok(response)
}

#[utoipa::path(
    get,
    path = "/fhir/{resource_type}/{id}",
    params(
        ("resource_type" = String, Path, description = "Resource type"),
        ("id" = String, Path, description = "Resource id, or `$lookup` on MedicinalProduct"),
        ("code" = Option<String>, Query, description = "`$lookup`: ATC code or MPID"),
        ("system" = Option<String>, Query, description = "`$lookup`: code system")
    ),
    responses(
        (status = 200, description = "Resource"),
        (status = 404, description = "Not found"),
        (status = 409, description = "`$lookup` matched several products")
    )
)]
/// Read a resource by id, or run the `$lookup` operation.
async fn read_or_operate(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    QueryParams(params): QueryParams<HashMap<String, String>>,
) -> Result<FhirJson, ApiError> {
    if let Some(operation) = id.strip_prefix('$') {
        if resource_type != MEDICINAL_PRODUCT || operation != "lookup" {
            return Err(unknown_operation(operation).into());
        }
        let product = lookup(&state.store, params.get("code"), params.get("system"))?;
        return Ok(FhirJson(StatusCode::OK, state.render(&product)?));
    }
    let instance = instance_of_type(&state.store, &resource_type, &id)?;
    Ok(FhirJson(StatusCode::OK, state.render(&instance)?))
}

#[utoipa::path(
    post,
    path = "/fhir/{resource_type}/{id}",
    params(
        ("resource_type" = String, Path, description = "Resource type"),
        ("id" = String, Path, description = "`$lookup` on MedicinalProduct"),
        ("code" = Option<String>, Query, description = "ATC code or MPID"),
        ("system" = Option<String>, Query, description = "Code system")
    ),
    request_body(content = String, description = "`code` and `system`, flat or as Parameters"),
    responses(
        (status = 200, description = "Resource"),
        (status = 400, description = "Missing code or malformed body"),
        (status = 404, description = "Not found"),
        (status = 409, description = "Several products matched")
    )
)]
/// Run the `$lookup` operation with its parameters in the request body.
///
/// Body values take precedence over query values of the same name.
async fn operate_on_instance(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    QueryParams(mut params): QueryParams<HashMap<String, String>>,
    body: Bytes,
) -> Result<FhirJson, ApiError> {
    let operation = id.strip_prefix('$').unwrap_or(&id);
    if resource_type != MEDICINAL_PRODUCT || operation != "lookup" {
        return Err(unknown_operation(operation).into());
    }
    if !body.iter().all(u8::is_ascii_whitespace) {
        params.extend(body_parameters(&parse_body(&body)?)?);
    }
    let product = lookup(&state.store, params.get("code"), params.get("system"))?;
    Ok(FhirJson(StatusCode::OK, state.render(&product)?))
}

#[utoipa::path(
    put,
    path = "/fhir/{resource_type}/{id}",
    params(
        ("resource_type" = String, Path, description = "Resource type"),
        ("id" = String, Path, description = "Resource id")
    ),
    request_body(content = String, description = "FHIR resource"),
    responses(
        (status = 200, description = "Updated"),
        (status = 400, description = "Validation failed"),
        (status = 404, description = "Not found")
    )
)]
/// Replace the fields of a resource.
async fn update_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    body: Bytes,
) -> Result<FhirJson, ApiError> {
    let existing = instance_of_type(&state.store, &resource_type, &id)?;
    let document = parse_body(&body)?;
    let fields = state.mapper().from_document(&checked_type(&document, &resource_type)?)?;
    let updated = state.store.update(&existing.id, fields)?;
    Ok(FhirJson(StatusCode::OK, state.render(&updated)?))
}

#[utoipa::path(
    delete,
    path = "/fhir/{resource_type}/{id}",
    params(
        ("resource_type" = String, Path, description = "Resource type"),
        ("id" = String, Path, description = "Resource id")
    ),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Not found")
    )
)]
async fn delete_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let existing = instance_of_type(&state.store, &resource_type, &id)?;
    state.store.delete(&existing.id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

fn resource_url(instance: &ResourceInstance) -> String {
    format!("/fhir/{}/{}", instance.resource_type, instance.id)
}

fn parse_body(body: &[u8]) -> IdmpResult<Value> {
    serde_json::from_slice(body)
        .map_err(|e| IdmpError::InvalidInput(format!("request body is not valid JSON: {e}")))
}

/// The identifier value when it is usable as a key, a generated one otherwise.
fn new_key(fields: &FieldMap) -> IdmpResult<ResourceKey> {
    if let Some(FieldValue::Text(identifier)) = fields.get("identifier") {
        if let Ok(key) = ResourceKey::new(identifier) {
            return Ok(key);
        }
    }
    Ok(ResourceKey::new(ResourceId::new().to_string())?)
}

/// String parameters of an operation body: a flat object, or a `Parameters` resource.
fn body_parameters(document: &Value) -> IdmpResult<HashMap<String, String>> {
    let object = document
        .as_object()
        .ok_or_else(|| IdmpError::InvalidInput("operation body must be an object".into()))?;
    if object.get("resourceType").and_then(Value::as_str) != Some("Parameters") {
        return Ok(object
            .iter()
            .filter_map(|(name, value)| Some((name.clone(), value.as_str()?.to_owned())))
            .collect());
    }

    let mut params = HashMap::new();
    for parameter in object.get("parameter").and_then(Value::as_array).into_iter().flatten() {
        let Some(name) = parameter.get("name").and_then(Value::as_str) else {
            continue;
        };
        let value = ["valueCode", "valueString", "valueUri"]
            .iter()
            .find_map(|key| parameter.get(*key).and_then(Value::as_str));
        if let Some(value) = value {
            params.insert(name.to_owned(), value.to_owned());
        }
    }
    Ok(params)
}

fn unknown_operation(operation: &str) -> IdmpError {
    IdmpError::UnsupportedResourceType(format!("operation ${operation}"))
}

/// The document, once its `resourceType` is known to equal the path type.
fn checked_type(document: &Value, resource_type: &str) -> IdmpResult<Value> {
    match document.get("resourceType").and_then(Value::as_str) {
        Some(declared) if declared == resource_type => Ok(document.clone()),
        Some(declared) => Err(IdmpError::InvalidInput(format!(
            "resourceType '{declared}' does not match the endpoint type '{resource_type}'"
        ))),
        None => Err(IdmpError::InvalidInput("missing resourceType".into())),
    }
}

/// Fetch `id`, reporting instances of another type as not found.
fn instance_of_type(
    store: &ResourceStore,
    resource_type: &str,
    id: &str,
) -> IdmpResult<ResourceInstance> {
    if !store.registry().contains(resource_type)? {
        return Err(IdmpError::UnsupportedResourceType(resource_type.to_owned()));
    }
    let not_found = || IdmpError::NotFound(format!("{resource_type}/{id}"));
    let id = ResourceId::parse(id).map_err(|_| not_found())?;
    match store.get_by_id(&id) {
        Ok(instance) if instance.resource_type == resource_type => Ok(instance),
        Ok(_) | Err(IdmpError::NotFound(_)) => Err(not_found()),
        Err(err) => Err(err),
    }
}

/// Find the one published product whose ATC classification or MPID matches `code`.
///
/// Without a system both are tried.
fn lookup(
    store: &ResourceStore,
    code: Option<&String>,
    system: Option<&String>,
) -> IdmpResult<ResourceInstance> {
    let code = code
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| IdmpError::InvalidInput("$lookup requires a code".into()))?;

    let mut fields = Vec::new();
    match system.map(String::as_str) {
        Some(ATC_SYSTEM) => fields.push("classification"),
        Some(MPID_SYSTEM) => fields.push("identifier"),
        Some(other) => {
            return Err(IdmpError::NotFound(format!(
                "no medicinal product for {other}|{code}"
            )))
        }
        None => fields.extend(["classification", "identifier"]),
    }

    let mut matches: Vec<ResourceInstance> = Vec::new();
    for field in fields {
        let page = store.query(MEDICINAL_PRODUCT, &Query::matching(Clause::equals(field, code)))?;
        for instance in page.items {
            if !matches.iter().any(|m| m.id == instance.id) {
                matches.push(instance);
            }
        }
    }
    match matches.len() {
        0 => Err(IdmpError::NotFound(format!(
            "no medicinal product found for code {code}"
        ))),
        1 => Ok(matches.remove(0)),
        n => Err(IdmpError::AmbiguousChoice {
            field: "code".into(),
            reason: format!("{n} medicinal products match {code}"),
        }),
    }
}
