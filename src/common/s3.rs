//! Helper code for working with S3.

/// Return the S3 configuration from environment variables.
///
/// `AWS_ENDPOINT_URL` optionally redirects all calls to a custom endpoint
/// (MinIO-style deployments) with path-style addressing.
pub async fn config_from_env() -> Result<aws_sdk_s3::config::Config, anyhow::Error> {
    let config = aws_config::from_env().load().await;
    let builder = aws_sdk_s3::config::Builder::from(&config);
    match std::env::var("AWS_ENDPOINT_URL") {
        Ok(endpoint_url) => {
            tracing::trace!("will use endpoint url {:?}", &endpoint_url);
            Ok(builder
                .endpoint_url(endpoint_url)
                .force_path_style(true)
                .build())
        }
        Err(_) => Ok(builder.build()),
    }
}

/// Construct an S3 client from environment variables.
pub async fn client_from_env() -> Result<aws_sdk_s3::Client, anyhow::Error> {
    Ok(aws_sdk_s3::Client::from_conf(config_from_env().await?))
}
