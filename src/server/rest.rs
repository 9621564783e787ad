//! Implementation of the actix server.

use std::time::Instant;

use actix_web::{
    get,
    middleware::Logger,
    post,
    web::{self, Data, Json, Path},
    App, HttpServer, Responder, ResponseError,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::err::Error;
use crate::query::{parse_query_args, Cursor, Engine, Page};

use super::WebServerData;

/// Error wrapper mapping the engine taxonomy onto HTTP statuses.
#[derive(Debug)]
struct CustomError {
    err: Error,
}

impl std::fmt::Display for CustomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.err)
    }
}

impl From<Error> for CustomError {
    fn from(err: Error) -> Self {
        CustomError { err }
    }
}

impl ResponseError for CustomError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        actix_web::http::StatusCode::from_u16(self.err.status())
            .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> actix_web::HttpResponse {
        actix_web::HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": self.err.to_string(),
            "code": self.err.code(),
        }))
    }
}

/// Shape of the `data` field, controlled by `format=row|column`.
#[derive(Serialize, Debug)]
#[serde(untagged)]
enum ResponseData {
    Rows(Vec<serde_json::Value>),
    Columns(IndexMap<String, Vec<serde_json::Value>>),
}

#[derive(Serialize, Debug)]
struct Profile {
    query: f64,
    fetch: f64,
}

#[derive(Serialize, Debug)]
struct Progress {
    bytes_read: u64,
    bytes_total: u64,
}

/// Response envelope shared by the query endpoints.
#[derive(Serialize, Debug)]
struct Envelope {
    continuation: Option<String>,
    count: usize,
    page: u32,
    data: ResponseData,
    index: String,
    limit: Option<u64>,
    profile: Profile,
    progress: Progress,
    q: Vec<String>,
}

/// Fold row records into column vectors, preserving encounter order of the
/// column names and padding missing fields with null.
fn to_columns(records: Vec<serde_json::Value>) -> IndexMap<String, Vec<serde_json::Value>> {
    let mut columns: IndexMap<String, Vec<serde_json::Value>> = IndexMap::new();
    for record in &records {
        if let Some(map) = record.as_object() {
            for name in map.keys() {
                columns.entry(name.clone()).or_default();
            }
        }
    }
    for record in &records {
        for (name, values) in columns.iter_mut() {
            values.push(record.get(name).cloned().unwrap_or(serde_json::Value::Null));
        }
    }
    columns
}

/// Split a comma-separated `q` parameter into raw query values.
fn split_q(q: Option<&str>) -> Vec<String> {
    q.map(|q| {
        q.split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn page_envelope(
    data: &WebServerData,
    index: &str,
    cursor: Cursor,
    page: Page,
    plan_seconds: f64,
    format: Option<&str>,
    limit: Option<u64>,
) -> Envelope {
    let continuation = (!page.done).then(|| data.continuations.mint(cursor.clone()));
    let count = page.records.len();
    Envelope {
        continuation,
        count,
        page: cursor.page,
        data: match format {
            Some("column") => ResponseData::Columns(to_columns(page.records)),
            _ => ResponseData::Rows(page.records),
        },
        index: index.to_string(),
        limit,
        profile: Profile {
            query: plan_seconds,
            fetch: page.fetch_seconds,
        },
        progress: Progress {
            bytes_read: cursor.bytes_read,
            bytes_total: cursor.bytes_total,
        },
        q: cursor.q,
    }
}

/// Parameters of the GET query endpoints.
#[derive(Deserialize, Debug)]
struct QueryParams {
    q: Option<String>,
    format: Option<String>,
    limit: Option<u64>,
}

/// Body of the POST query endpoint (GraphQL collaborator).
#[derive(Deserialize, Debug)]
struct QueryBody {
    index: String,
    #[serde(default)]
    q: Vec<String>,
    format: Option<String>,
    limit: Option<u64>,
}

/// Parameters of the continuation endpoint.
#[derive(Deserialize, Debug)]
struct ContParams {
    token: String,
    format: Option<String>,
}

async fn run_query(
    data: &WebServerData,
    index: &str,
    q: Vec<String>,
    format: Option<&str>,
    limit: Option<u64>,
) -> Result<Json<Envelope>, CustomError> {
    let started = Instant::now();
    let catalog = Catalog::open(&data.config.database)?;
    let engine = Engine {
        config: &data.config,
        catalog: &catalog,
        store: &data.store,
    };

    let spec = catalog.get(index)?;
    let (keys, locus) = parse_query_args(&spec, &q, data.resolver.as_deref())?;
    let (spec, mut cursor) = engine.plan(index, keys, locus, q)?;
    cursor.limit = limit;
    let plan_seconds = started.elapsed().as_secs_f64();

    let page = engine.fetch_page(&spec, &mut cursor).await?;
    Ok(Json(page_envelope(
        data,
        &spec.name,
        cursor,
        page,
        plan_seconds,
        format,
        limit,
    )))
}

/// List all indexes with their schema and build state.
#[get("/api/bio/indexes")]
async fn list_indexes(data: Data<WebServerData>) -> actix_web::Result<impl Responder, CustomError> {
    let catalog = Catalog::open(&data.config.database)?;
    let indexes: Vec<serde_json::Value> = catalog
        .list()?
        .into_iter()
        .map(|spec| {
            serde_json::json!({
                "index": spec.name,
                "schemaName": spec.schema_name,
                "schema": spec.schema.to_string(),
                "prefix": spec.prefix,
                "built": spec.built,
                "compressed": spec.compressed,
                "builtAt": spec.built_at.map(|t| t.to_rfc3339()),
            })
        })
        .collect();
    Ok(Json(indexes))
}

/// Stream the first page of a query.
#[get("/api/bio/query/{index}")]
async fn query_index(
    data: Data<WebServerData>,
    path: Path<String>,
    params: web::Query<QueryParams>,
) -> actix_web::Result<impl Responder, CustomError> {
    let index = path.into_inner();
    run_query(
        &data,
        &index,
        split_q(params.q.as_deref()),
        params.format.as_deref(),
        params.limit,
    )
    .await
}

/// POST variant of the query endpoint, used by the GraphQL collaborator.
#[post("/api/bio/query")]
async fn query_post(
    data: Data<WebServerData>,
    body: Json<QueryBody>,
) -> actix_web::Result<impl Responder, CustomError> {
    let body = body.into_inner();
    run_query(&data, &body.index, body.q, body.format.as_deref(), body.limit).await
}

/// Approximate count of the matching records.
#[get("/api/bio/count/{index}")]
async fn count_index(
    data: Data<WebServerData>,
    path: Path<String>,
    params: web::Query<QueryParams>,
) -> actix_web::Result<impl Responder, CustomError> {
    let started = Instant::now();
    let index = path.into_inner();
    let q = split_q(params.q.as_deref());
    let catalog = Catalog::open(&data.config.database)?;
    let engine = Engine {
        config: &data.config,
        catalog: &catalog,
        store: &data.store,
    };

    let spec = catalog.get(&index)?;
    let (keys, locus) = parse_query_args(&spec, &q, data.resolver.as_deref())?;
    let count = engine.count(&index, keys, locus).await?;
    Ok(Json(Envelope {
        continuation: None,
        count: count as usize,
        page: 1,
        data: ResponseData::Rows(Vec::new()),
        index,
        limit: None,
        profile: Profile {
            query: started.elapsed().as_secs_f64(),
            fetch: 0.0,
        },
        progress: Progress {
            bytes_read: 0,
            bytes_total: 0,
        },
        q,
    }))
}

/// Distinct first-key values beginning with the `q` prefix.
#[get("/api/bio/match/{index}")]
async fn match_index(
    data: Data<WebServerData>,
    path: Path<String>,
    params: web::Query<QueryParams>,
) -> actix_web::Result<impl Responder, CustomError> {
    let started = Instant::now();
    let index = path.into_inner();
    let prefix = params.q.clone().unwrap_or_default();
    let catalog = Catalog::open(&data.config.database)?;

    let values = crate::query::stats::match_keys(&catalog, &data.config, &index, &prefix)?;
    let count = values.len();
    Ok(Json(Envelope {
        continuation: None,
        count,
        page: 1,
        data: ResponseData::Rows(values.into_iter().map(serde_json::Value::String).collect()),
        index,
        limit: Some(data.config.match_limit),
        profile: Profile {
            query: started.elapsed().as_secs_f64(),
            fetch: 0.0,
        },
        progress: Progress {
            bytes_read: 0,
            bytes_total: 0,
        },
        q: vec![prefix],
    }))
}

/// Resume a partially-streamed query from a continuation token.
#[get("/api/bio/cont")]
async fn continue_query(
    data: Data<WebServerData>,
    params: web::Query<ContParams>,
) -> actix_web::Result<impl Responder, CustomError> {
    let started = Instant::now();
    let mut cursor = data.continuations.resume(&params.token)?;
    let catalog = Catalog::open(&data.config.database)?;
    let engine = Engine {
        config: &data.config,
        catalog: &catalog,
        store: &data.store,
    };
    let spec = catalog.get(&cursor.index)?;
    let plan_seconds = started.elapsed().as_secs_f64();

    let page = engine.fetch_page(&spec, &mut cursor).await?;
    let index = cursor.index.clone();
    let limit = cursor.limit;
    Ok(Json(page_envelope(
        &data,
        &index,
        cursor,
        page,
        plan_seconds,
        params.format.as_deref(),
        limit,
    )))
}

#[actix_web::main]
pub async fn main(args: &super::Args, data: Data<WebServerData>) -> std::io::Result<()> {
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .service(list_indexes)
            .service(query_index)
            .service(query_post)
            .service(count_index)
            .service(match_index)
            .service(continue_query)
            .wrap(Logger::default())
    })
    .bind((args.listen_host.as_str(), args.port))?
    .run()
    .await
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn split_q() {
        assert_eq!(
            super::split_q(Some("T2D,8:100-200")),
            vec!["T2D".to_string(), "8:100-200".to_string()]
        );
        assert_eq!(super::split_q(Some("")), Vec::<String>::new());
        assert_eq!(super::split_q(None), Vec::<String>::new());
    }

    #[test]
    fn to_columns_pads_missing_fields() {
        let records = vec![
            json!({"a": 1, "b": 2}),
            json!({"b": 3, "c": 4}),
        ];

        let columns = super::to_columns(records);

        assert_eq!(
            columns.keys().cloned().collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert_eq!(columns["a"], vec![json!(1), json!(null)]);
        assert_eq!(columns["b"], vec![json!(2), json!(3)]);
        assert_eq!(columns["c"], vec![json!(null), json!(4)]);
    }
}
