use std::time::Duration;

use respatch::settings::ReloadSettings;
use respatch::watch::{WatchConfig, watch_sources};

fn config(root: &std::path::Path) -> WatchConfig {
    let settings = ReloadSettings { debounce_ms: 50, ..ReloadSettings::default() };
    WatchConfig::from_settings(root, &settings)
}

#[test]
fn delivers_debounced_source_events() {
    let dir = tempfile::tempdir().unwrap();
    let watcher = watch_sources(config(dir.path())).unwrap();

    // Give the backend a moment to arm before writing.
    std::thread::sleep(Duration::from_millis(200));
    let path = dir.path().join("Player.cs");
    std::fs::write(&path, "class C { }").unwrap();

    let got = watcher
        .events
        .recv_timeout(Duration::from_secs(10))
        .expect("watcher should deliver the edit");
    assert_eq!(got.file_name(), path.file_name());
}

#[test]
fn burst_of_writes_collapses_to_one_event() {
    let dir = tempfile::tempdir().unwrap();
    let watcher = watch_sources(config(dir.path())).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    let path = dir.path().join("Enemy.cs");
    for i in 0..5 {
        std::fs::write(&path, format!("class C {{ }} // {i}")).unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }

    let first = watcher.events.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(first.file_name(), path.file_name());
    // The burst settles into a single delivery.
    assert!(watcher.events.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn filtered_paths_never_surface() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("Editor")).unwrap();
    let watcher = watch_sources(config(dir.path())).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    std::fs::write(dir.path().join("notes.txt"), "not a source").unwrap();
    std::fs::write(dir.path().join("Editor").join("Tool.cs"), "class T { }").unwrap();
    std::fs::write(dir.path().join("Bindings.g.cs"), "class G { }").unwrap();

    assert!(watcher.events.recv_timeout(Duration::from_millis(500)).is_err());
}
