fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only rerun if proto files change
    println!("cargo:rerun-if-changed=proto/courier/v1/runtime.proto");
    println!("cargo:rerun-if-changed=proto/courier/v1/appcallback.proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[
                "proto/courier/v1/appcallback.proto",
                "proto/courier/v1/runtime.proto",
            ],
            &["proto"],
        )?;
    Ok(())
}
