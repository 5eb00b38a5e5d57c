fn main() {
    tasktally_lib::run()
}
