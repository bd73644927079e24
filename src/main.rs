fn main() {
    robogo_bridge_lib::run()
}
