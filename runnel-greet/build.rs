// Compiles proto/greet.proto with protox, so building needs no protoc.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/greet.proto");

    let fds = protox::compile(["proto/greet.proto"], ["proto"])?;
    prost_build::Config::new().compile_fds(fds)?;

    Ok(())
}
