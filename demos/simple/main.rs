use std::time::Duration;

use flagsync::{ClientConfig, FileStore, Identity, ObserverOwner};

pub fn main() {
    env_logger::init();

    let environment_key = std::env::var("FLAGSYNC_ENVIRONMENT_KEY").unwrap();
    let identity = Identity::new("test-user", environment_key.clone());

    // Flags of recently used identities survive restarts in this directory.
    let storage = FileStore::open(std::env::temp_dir().join("flagsync-demo")).unwrap();

    let client = ClientConfig::new(environment_key)
        .storage(storage)
        .evaluation_reasons(true)
        .evaluation_logger(|event| {
            println!("Evaluation: {:?}", event);
        })
        .to_client(identity)
        .unwrap();

    // Served from the cache, if a previous run stored this identity's flags.
    println!(
        "Cached flags: {:?} (from cache: {})",
        client.all_flags(),
        client.is_serving_cached_flags()
    );

    let owner = ObserverOwner::new();
    client.observe("a-boolean-flag", &owner, |change| {
        println!("a-boolean-flag: {:?} -> {:?}", change.old_value, change.new_value);
    });
    client.observe_connection_mode_changed(&owner, |mode| {
        println!("Connection mode: {}", mode);
    });

    std::thread::sleep(Duration::from_secs(10));

    let enabled = client
        .variation("a-boolean-flag", false)
        .as_bool()
        // default value
        .unwrap_or(false);
    println!("a-boolean-flag: {:?}", enabled);
    println!("{:?}", client.variation_detail("a-boolean-flag", false));
    println!("{}", client.connection_information());

    client.shutdown().unwrap();
}
