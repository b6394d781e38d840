fn main() -> std::io::Result<()> {
    prost_build::compile_protos(&["proto/sparkplug_b.proto"], &["proto/"])
}
