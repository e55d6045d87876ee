use actix_web::http::{StatusCode, header};
use actix_web::{HttpRequest, HttpResponse, Responder, get, post, put, web};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapters::db::Paging;
use crate::domain::models::{RoamingEndpoint, RoamingRole};
use crate::domain::ocpi::{CommandType, OcpiResponse, STATUS_CLIENT_ERROR};
use crate::roaming::RoamingContext;
use crate::roaming::error::{ErrorFamily, RoamingError};
use crate::roaming::locations::list_public_locations;

const DEFAULT_PAGE_LIMIT: u32 = 50;
const MAX_PAGE_LIMIT: u32 = 500;

#[derive(Clone)]
pub struct ApiState {
    pub ctx: RoamingContext,
}

impl ApiState {
    pub fn new(ctx: RoamingContext) -> Self {
        Self { ctx }
    }

    fn success<T: Serialize>(&self, data: T) -> HttpResponse {
        HttpResponse::Ok().json(OcpiResponse::success(data, self.ctx.clock.now()))
    }

    fn failure(&self, error: &RoamingError) -> HttpResponse {
        let status = match error.family() {
            ErrorFamily::Validation => StatusCode::BAD_REQUEST,
            ErrorFamily::NotFound => StatusCode::NOT_FOUND,
            ErrorFamily::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %error, "ocpi request failed");
        } else {
            tracing::info!(error = %error, "ocpi request refused");
        }

        HttpResponse::build(status).json(OcpiResponse::<()>::error(
            error.ocpi_status(),
            error.to_string(),
            self.ctx.clock.now(),
        ))
    }

    fn unauthorized(&self) -> HttpResponse {
        HttpResponse::Unauthorized().json(OcpiResponse::<()>::error(
            STATUS_CLIENT_ERROR,
            "missing or unknown token",
            self.ctx.clock.now(),
        ))
    }

    fn authorize(
        &self,
        req: &HttpRequest,
        tenant_id: &str,
        role: RoamingRole,
    ) -> Result<RoamingEndpoint, HttpResponse> {
        let Some(token) = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Token "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
        else {
            return Err(self.unauthorized());
        };

        match self.ctx.store.endpoint_by_local_token(tenant_id, token) {
            Ok(Some(endpoint)) if endpoint.role == role => Ok(endpoint),
            Ok(_) => {
                tracing::warn!(tenant = %tenant_id, role = role.as_str(), "token rejected");
                Err(self.unauthorized())
            }
            Err(error) => Err(self.failure(&RoamingError::from(error))),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(put_session)
        .service(post_cdr)
        .service(post_command)
        .service(list_locations);
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

fn parse_body(body: &[u8]) -> Result<Value, RoamingError> {
    serde_json::from_slice(body)
        .map_err(|error| RoamingError::InvalidParameters(format!("malformed body: {error}")))
}

#[put("/ocpi/{tenant_id}/emsp/2.1.1/sessions/{country_code}/{party_id}/{session_id}")]
async fn put_session(
    state: web::Data<ApiState>,
    req: HttpRequest,
    path: web::Path<(String, String, String, String)>,
    body: web::Bytes,
) -> HttpResponse {
    let (tenant_id, _country_code, _party_id, session_id) = path.into_inner();
    if let Err(response) = state.authorize(&req, &tenant_id, RoamingRole::Emsp) {
        return response;
    }

    let payload = match parse_body(&body) {
        Ok(payload) => payload,
        Err(error) => return state.failure(&error),
    };
    if payload.get("id").and_then(Value::as_str) != Some(session_id.as_str()) {
        return state.failure(&RoamingError::InvalidParameters(format!(
            "session id in body does not match {session_id}"
        )));
    }

    match state.ctx.reconciler().reconcile_value(&tenant_id, &payload) {
        Ok(outcome) => {
            tracing::debug!(
                tenant = %tenant_id,
                session_id = %session_id,
                outcome = ?outcome,
                "session received"
            );
            state.success(())
        }
        Err(error) => state.failure(&error),
    }
}

#[post("/ocpi/{tenant_id}/emsp/2.1.1/cdrs")]
async fn post_cdr(
    state: web::Data<ApiState>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
) -> HttpResponse {
    let tenant_id = path.into_inner();
    if let Err(response) = state.authorize(&req, &tenant_id, RoamingRole::Emsp) {
        return response;
    }

    let result = parse_body(&body)
        .and_then(|payload| state.ctx.cdr_processor().process_value(&tenant_id, &payload));
    match result {
        Ok(_) => state.success(()),
        Err(error) => state.failure(&error),
    }
}

#[post("/ocpi/{tenant_id}/cpo/2.1.1/commands/{command}")]
async fn post_command(
    state: web::Data<ApiState>,
    req: HttpRequest,
    path: web::Path<(String, String)>,
    body: web::Bytes,
) -> HttpResponse {
    let (tenant_id, command) = path.into_inner();
    let endpoint = match state.authorize(&req, &tenant_id, RoamingRole::Cpo) {
        Ok(endpoint) => endpoint,
        Err(response) => return response,
    };

    let Some(command) = CommandType::from_path(&command) else {
        return state.failure(&RoamingError::InvalidParameters(format!(
            "unknown command {command}"
        )));
    };
    let payload = match parse_body(&body) {
        Ok(payload) => payload,
        Err(error) => return state.failure(&error),
    };
    let callback = match state.ctx.clients.client_for(&tenant_id, &endpoint) {
        Ok(client) => client,
        Err(error) => return state.failure(&RoamingError::from(error)),
    };

    // The follow-up task keeps running after the acknowledgement is sent.
    match state
        .ctx
        .command_correlator()
        .handle(&tenant_id, command, &payload, callback)
    {
        Ok(outcome) => state.success(outcome.response),
        Err(error) => state.failure(&error),
    }
}

#[get("/ocpi/{tenant_id}/cpo/2.1.1/locations")]
async fn list_locations(
    state: web::Data<ApiState>,
    req: HttpRequest,
    path: web::Path<String>,
    query: web::Query<ListQuery>,
) -> HttpResponse {
    let tenant_id = path.into_inner();
    if let Err(response) = state.authorize(&req, &tenant_id, RoamingRole::Cpo) {
        return response;
    }

    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let page = match list_public_locations(
        &state.ctx.store,
        &tenant_id,
        &state.ctx.policies,
        Paging {
            limit,
            skip: offset,
        },
    ) {
        Ok(page) => page,
        Err(error) => return state.failure(&error),
    };

    let served = i64::from(offset) + page.result.len() as i64;
    let mut response = HttpResponse::Ok();
    response
        .insert_header(("X-Total-Count", page.count.to_string()))
        .insert_header(("X-Limit", limit.to_string()));
    if !page.result.is_empty() && served < page.count {
        let info = req.connection_info();
        let next = format!(
            "{}://{}{}?offset={served}&limit={limit}",
            info.scheme(),
            info.host(),
            req.path()
        );
        response.insert_header((header::LINK, format!("<{next}>; rel=\"next\"")));
    }

    response.json(OcpiResponse::success(page.result, state.ctx.clock.now()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use actix_web::dev::ServiceResponse;
    use actix_web::http::{StatusCode, header};
    use actix_web::{App, body::to_bytes, test, web};
    use serde_json::{Value, json};

    use crate::adapters::partner_http::parse_next_link;
    use crate::adapters::station_commands::StationCommandStatus;
    use crate::app::services::SqliteRoamingStore;
    use crate::domain::models::{ChargingStation, RoamingRole, Transaction};
    use crate::domain::ocpi::CommandResult;
    use crate::roaming::{RoamingContext, SyncSettings};
    use crate::test_support::{
        FakePartner, FakeStations, ManualClock, at, cdr_payload, endpoint, fixed_registry,
        session_payload, station, tag, test_store, user,
    };

    use super::{ApiState, configure_routes};

    const EMSP_TOKEN: &str = "Token local-ep-emsp";
    const CPO_TOKEN: &str = "Token local-ep-cpo";

    fn build_state(name: &str) -> (ApiState, SqliteRoamingStore, Arc<FakePartner>) {
        let store = test_store(name);
        store
            .upsert("t1", &endpoint("ep-emsp", RoamingRole::Emsp))
            .expect("seed endpoint");
        store
            .upsert("t1", &endpoint("ep-cpo", RoamingRole::Cpo))
            .expect("seed endpoint");

        let partner = Arc::new(FakePartner::default());
        let ctx = RoamingContext::new(
            store.clone(),
            FakeStations::answering(StationCommandStatus::Accepted),
            SyncSettings::default(),
        )
        .with_clock(ManualClock::new(at(12, 0, 0)))
        .with_clients(fixed_registry(partner.clone()));

        (ApiState::new(ctx), store, partner)
    }

    async fn body_json(resp: ServiceResponse) -> Value {
        let body = to_bytes(resp.into_body())
            .await
            .expect("body should be readable");
        serde_json::from_slice(&body).expect("body should be json")
    }

    async fn call(state: ApiState, req: test::TestRequest) -> ServiceResponse {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;
        test::call_service(&app, req.to_request()).await
    }

    #[actix_web::test]
    async fn health_endpoint_returns_ok() {
        let (state, _, _) = build_state("api-health");

        let req = test::TestRequest::get().uri("/health");
        let resp = call(state, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn requests_without_a_known_token_are_unauthorized() {
        let (state, _, _) = build_state("api-auth");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let missing = test::TestRequest::get()
            .uri("/ocpi/t1/cpo/2.1.1/locations")
            .to_request();
        assert_eq!(
            test::call_service(&app, missing).await.status(),
            StatusCode::UNAUTHORIZED
        );

        let wrong_role = test::TestRequest::get()
            .uri("/ocpi/t1/cpo/2.1.1/locations")
            .insert_header((header::AUTHORIZATION, EMSP_TOKEN))
            .to_request();
        assert_eq!(
            test::call_service(&app, wrong_role).await.status(),
            StatusCode::UNAUTHORIZED
        );

        let other_tenant = test::TestRequest::get()
            .uri("/ocpi/t2/cpo/2.1.1/locations")
            .insert_header((header::AUTHORIZATION, CPO_TOKEN))
            .to_request();
        assert_eq!(
            test::call_service(&app, other_tenant).await.status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[actix_web::test]
    async fn put_session_creates_the_roaming_transaction() {
        let (state, store, _) = build_state("api-session");
        store
            .upsert("t1", &station("CS-1", "LOC-1", false))
            .expect("seed station");
        store.upsert("t1", &tag("TAG-1", true, "U-1")).expect("seed tag");
        store.upsert("t1", &user("U-1", true)).expect("seed user");

        let req = test::TestRequest::put()
            .uri("/ocpi/t1/emsp/2.1.1/sessions/FR/SLF/S-1")
            .insert_header((header::AUTHORIZATION, EMSP_TOKEN))
            .set_json(session_payload("S-1", "CS-1*1", 2.0, "ACTIVE", at(10, 30, 0)))
            ;
        let resp = call(state, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status_code"], 1000);
        let transaction: Transaction = store
            .transaction_by_session_id("t1", "S-1")
            .expect("query should succeed")
            .expect("transaction should exist");
        assert_eq!(transaction.charge_box_id, "CS-1");
    }

    #[actix_web::test]
    async fn put_session_maps_domain_errors_to_ocpi_statuses() {
        let (state, _, _) = build_state("api-session-errors");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let unknown_evse = test::TestRequest::put()
            .uri("/ocpi/t1/emsp/2.1.1/sessions/FR/SLF/S-1")
            .insert_header((header::AUTHORIZATION, EMSP_TOKEN))
            .set_json(session_payload("S-1", "CS-404*1", 2.0, "ACTIVE", at(10, 30, 0)))
            .to_request();
        let resp = test::call_service(&app, unknown_evse).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["status_code"], 2003);

        let mismatched = test::TestRequest::put()
            .uri("/ocpi/t1/emsp/2.1.1/sessions/FR/SLF/S-2")
            .insert_header((header::AUTHORIZATION, EMSP_TOKEN))
            .set_json(session_payload("S-1", "CS-1*1", 2.0, "ACTIVE", at(10, 30, 0)))
            .to_request();
        let resp = test::call_service(&app, mismatched).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["status_code"], 2001);

        let malformed = test::TestRequest::put()
            .uri("/ocpi/t1/emsp/2.1.1/sessions/FR/SLF/S-1")
            .insert_header((header::AUTHORIZATION, EMSP_TOKEN))
            .set_payload("{not json")
            .to_request();
        let resp = test::call_service(&app, malformed).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn cdr_for_unknown_session_is_not_found() {
        let (state, _, _) = build_state("api-cdr-unknown");

        let req = test::TestRequest::post()
            .uri("/ocpi/t1/emsp/2.1.1/cdrs")
            .insert_header((header::AUTHORIZATION, EMSP_TOKEN))
            .set_json(cdr_payload("S-404", "CS-1*1"))
            ;
        let resp = call(state, req).await;

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["status_code"], 2004);
    }

    #[actix_web::test]
    async fn cdr_stops_a_received_session() {
        let (state, store, _) = build_state("api-cdr");
        store
            .upsert("t1", &station("CS-1", "LOC-1", false))
            .expect("seed station");
        store.upsert("t1", &tag("TAG-1", true, "U-1")).expect("seed tag");
        store.upsert("t1", &user("U-1", true)).expect("seed user");
        state
            .ctx
            .reconciler()
            .reconcile_value("t1", &session_payload("S-1", "CS-1*1", 2.0, "ACTIVE", at(10, 30, 0)))
            .expect("session should reconcile");

        let req = test::TestRequest::post()
            .uri("/ocpi/t1/emsp/2.1.1/cdrs")
            .insert_header((header::AUTHORIZATION, EMSP_TOKEN))
            .set_json(cdr_payload("S-1", "CS-1*1"))
            ;
        let resp = call(state, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        let transaction = store
            .transaction_by_session_id("t1", "S-1")
            .expect("query should succeed")
            .expect("transaction should exist");
        let stop = transaction.stop.expect("cdr should stop the transaction");
        assert_eq!(stop.total_consumption_wh, 12_500.0);
        assert_eq!(stop.price, 9.99);
    }

    #[actix_web::test]
    async fn start_session_is_acknowledged_then_called_back() {
        let (state, store, partner) = build_state("api-command-start");
        store
            .upsert("t1", &station("CS-1", "LOC-1", true))
            .expect("seed station");
        store.upsert("t1", &tag("TAG-P", false, "U-P")).expect("seed tag");
        store.upsert("t1", &user("U-P", false)).expect("seed user");

        let req = test::TestRequest::post()
            .uri("/ocpi/t1/cpo/2.1.1/commands/START_SESSION")
            .insert_header((header::AUTHORIZATION, CPO_TOKEN))
            .set_json(json!({
                "response_url": "http://partner.test/commands/START_SESSION/42",
                "token": {
                    "uid": "TAG-P",
                    "type": "RFID",
                    "auth_id": "NL-TNM-000001",
                    "issuer": "TheNewMotion",
                    "valid": true,
                    "whitelist": "ALLOWED",
                    "last_updated": "2026-03-01T09:00:00Z"
                },
                "location_id": "LOC-1",
                "evse_uid": "CS-1*1",
                "authorization_id": "AUTH-42"
            }))
            ;
        let resp = call(state, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["data"]["result"], "ACCEPTED");

        for _ in 0..100 {
            if !partner.callbacks.lock().expect("callbacks lock").is_empty() {
                break;
            }
            actix_web::rt::time::sleep(Duration::from_millis(10)).await;
        }
        let callbacks = partner.callbacks.lock().expect("callbacks lock");
        assert_eq!(callbacks.len(), 1);
        assert_eq!(callbacks[0].0, "http://partner.test/commands/START_SESSION/42");
        assert_eq!(callbacks[0].1.result, CommandResult::Accepted);

        let cs: ChargingStation = store
            .get("t1", "CS-1")
            .expect("query should succeed")
            .expect("station should exist");
        assert_eq!(cs.remote_authorizations.len(), 1);
    }

    #[actix_web::test]
    async fn unknown_commands_and_sessions_are_answered() {
        let (state, _, _) = build_state("api-command-stop");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let stop = test::TestRequest::post()
            .uri("/ocpi/t1/cpo/2.1.1/commands/STOP_SESSION")
            .insert_header((header::AUTHORIZATION, CPO_TOKEN))
            .set_json(json!({
                "response_url": "http://partner.test/commands/STOP_SESSION/7",
                "session_id": "S-404"
            }))
            .to_request();
        let resp = test::call_service(&app, stop).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["data"]["result"], "REJECTED");

        let reserve = test::TestRequest::post()
            .uri("/ocpi/t1/cpo/2.1.1/commands/RESERVE_NOW")
            .insert_header((header::AUTHORIZATION, CPO_TOKEN))
            .set_json(json!({}))
            .to_request();
        let resp = test::call_service(&app, reserve).await;
        assert_eq!(body_json(resp).await["data"]["result"], "NOT_SUPPORTED");

        let unknown = test::TestRequest::post()
            .uri("/ocpi/t1/cpo/2.1.1/commands/SELF_DESTRUCT")
            .insert_header((header::AUTHORIZATION, CPO_TOKEN))
            .set_json(json!({}))
            .to_request();
        let resp = test::call_service(&app, unknown).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn locations_are_paged_with_link_header() {
        let (state, store, _) = build_state("api-locations");
        for id in ["CS-1", "CS-2", "CS-3"] {
            store
                .upsert("t1", &station(id, &format!("LOC-{id}"), true))
                .expect("seed station");
        }
        let mut private = station("CS-9", "LOC-9", true);
        private.public = false;
        store.upsert("t1", &private).expect("seed station");

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let first = test::TestRequest::get()
            .uri("/ocpi/t1/cpo/2.1.1/locations?limit=2")
            .insert_header((header::AUTHORIZATION, CPO_TOKEN))
            .to_request();
        let resp = test::call_service(&app, first).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("X-Total-Count").expect("total"), "3");
        let link = resp
            .headers()
            .get(header::LINK)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_next_link)
            .expect("first page links the next");
        assert!(link.ends_with("/ocpi/t1/cpo/2.1.1/locations?offset=2&limit=2"));
        let json = body_json(resp).await;
        assert_eq!(json["data"].as_array().expect("locations").len(), 2);
        assert_eq!(json["data"][0]["evses"][0]["uid"], "CS-1*1");

        let last = test::TestRequest::get()
            .uri("/ocpi/t1/cpo/2.1.1/locations?offset=2&limit=2")
            .insert_header((header::AUTHORIZATION, CPO_TOKEN))
            .to_request();
        let resp = test::call_service(&app, last).await;
        assert!(resp.headers().get(header::LINK).is_none());
        let json = body_json(resp).await;
        assert_eq!(json["data"].as_array().expect("locations").len(), 1);
    }
}
