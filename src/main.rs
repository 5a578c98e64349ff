fn main() {
    let code = match joist::run::run() {
        Ok(code) => code,
        Err(err) => {
            println!("joist: error: {}", err);
            1
        }
    };
    std::process::exit(code);
}
