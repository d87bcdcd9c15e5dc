use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "kiln-server",
        description = "GPU generation lane scheduler API",
        version = "0.1.0",
        contact(name = "kiln-rs", url = "https://github.com/kiln-rs/kiln")
    ),
    paths(
        crate::routes::health::get_health,
        crate::routes::generate::generate,
        crate::routes::status::get_status,
        crate::routes::admin::list_lanes,
        crate::routes::admin::force_fallback,
        crate::routes::admin::restore_lane,
        crate::routes::internal::report_progress,
    ),
    components(schemas(
        crate::routes::generate::GenerateRequest,
        crate::routes::generate::ParamsBody,
        crate::routes::generate::GenerateAccepted,
        crate::routes::status::StatusResponse,
        crate::routes::internal::ProgressReport,
        crate::error::ErrorBody,
    ))
)]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}
