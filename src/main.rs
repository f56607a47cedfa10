fn main() {
    notes_sync_lib::run()
}
