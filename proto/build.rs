fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var(
        "PROTOC",
        protoc_bin_vendored::protoc_bin_path().expect("failed to locate vendored protoc"),
    );
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .build_transport(false)
        .compile_protos(
            &[
                "../api/proto/compass/v1/common.proto",
                "../api/proto/compass/v1/registry.proto",
                "../api/proto/compass/v1/config.proto",
                "../api/proto/compass/v1/stream.proto",
            ],
            &["../api/proto"],
        )?;
    Ok(())
}
