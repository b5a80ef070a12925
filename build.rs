fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only rerun if proto files change
    println!("cargo:rerun-if-changed=proto/channel_transfer/service.proto");
    println!("cargo:rerun-if-changed=proto/batcher/batcher.proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[
                "proto/channel_transfer/service.proto",
                "proto/batcher/batcher.proto",
            ],
            &["proto"],
        )?;
    Ok(())
}
