//! `giga status` – show all missions.

use giga_core::{DownloadEngine, Mission};

fn size(m: &Mission) -> String {
    if m.length == 0 {
        "-".to_string()
    } else {
        format!("{:.1} MiB", m.length as f64 / 1_048_576.0)
    }
}

pub fn run_status(engine: &DownloadEngine) {
    let missions = engine.missions();
    if missions.is_empty() {
        println!("No missions in database.");
        return;
    }
    println!(
        "{:<16}  {:<8}  {:>6}  {:>11}  {}",
        "ID", "STATE", "DONE", "SIZE", "PATH"
    );
    for m in missions {
        println!(
            "{:<16}  {:<8}  {:>5.1}%  {:>11}  {}",
            m.id,
            m.status,
            m.fraction() * 100.0,
            size(&m),
            m.path().display()
        );
        if let Some(err) = &m.error {
            println!("{:<16}  error: {}", "", err);
        }
    }
}
