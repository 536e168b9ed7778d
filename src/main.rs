fn main() {
    shootschedule_sync_lib::run()
}
