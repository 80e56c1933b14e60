fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The daemon's execution API, client side only
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(
            &["../ctrd-supervisor/proto/execution.proto"],
            &["../ctrd-supervisor/proto"],
        )?;
    Ok(())
}
