/// Watches the BlueZ object tree through a profile proxy.
///
/// Lists the objects BlueZ currently manages, then prints every interface
/// that appears or disappears until interrupted with Ctrl+C.
use bluez_proxy::{ObjectManagerEvent, Profile1, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let profile = Profile1::new("org.bluez", "/org/bluez/example/profile")?;

    let objects = profile.managed_objects().await?;
    println!("BlueZ manages {} objects:", objects.len());
    for (path, interfaces) in &objects {
        let mut names: Vec<_> = interfaces.keys().map(String::as_str).collect();
        names.sort_unstable();
        println!("  {} [{}]", path.as_str(), names.join(", "));
    }

    let (events, cancel) = profile.get_object_manager_signal().await?;
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(Some(event)) => match &*event {
                    ObjectManagerEvent::InterfacesAdded {
                        object_path,
                        interfaces,
                    } => {
                        for name in interfaces.keys() {
                            println!("+ {} {name}", object_path.as_str());
                        }
                    }
                    ObjectManagerEvent::InterfacesRemoved {
                        object_path,
                        interfaces,
                    } => {
                        for name in interfaces {
                            println!("- {} {name}", object_path.as_str());
                        }
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    eprintln!("Stopped watching: {e}");
                    break;
                }
            }
        }
    });

    println!("\nWatching for changes, press Ctrl+C to stop.");
    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Failed to wait for Ctrl+C: {e}");
    }

    cancel.cancel().await;
    if let Err(e) = printer.await {
        eprintln!("Printer task failed: {e}");
    }
    profile.close().await
}
