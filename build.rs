//! Build script generating the tonic stubs for the image prediction service.
//!
//! Messages are declared by hand in `src/codec.rs`, so only the service
//! plumbing is generated and no `protoc` is required.

use std::env;
use std::path::PathBuf;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

fn main() -> Result<()> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);

    let predict = tonic_build::manual::Method::builder()
        .name("predict")
        .route_name("Predict")
        .input_type("crate::codec::PredictionRequest")
        .output_type("crate::codec::VectorResponse")
        .codec_path("tonic::codec::ProstCodec")
        .client_streaming()
        .server_streaming()
        .build();

    let service = tonic_build::manual::Service::builder()
        .name("ImagePrediction")
        .package("image_prediction")
        .comment("Bidirectional image embedding stream")
        .method(predict)
        .build();

    tonic_build::manual::Builder::new()
        .out_dir(&out_dir)
        .compile(&[service]);

    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
