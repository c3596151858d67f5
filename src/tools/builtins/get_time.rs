use chrono::Local;

pub fn execute() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S %Z").to_string()
}
