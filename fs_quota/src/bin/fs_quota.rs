use fs_quota::*;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        println!("usage: fs_quota <user> <path:filesystem>...");
        println!("       ceph directories need: {}", CEPH_ATTRS.join(", "));
        return;
    }
    let targets = match parse_targets(&args[2..]) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("fs_quota: {}", e);
            std::process::exit(1);
        },
    };
    let collector = Collector::standard(QuotaCmdOptions::default());
    for target in &targets {
        println!("{}: {:#?}", target, collector.collect(&args[1], target));
    }
}
