use clap::ArgMatches;
use std::process::Command;

pub async fn run(matches: &ArgMatches) {
    let config = match super::load_config(matches) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("✗ {}", e);
            std::process::exit(1);
        }
    };

    println!("🔍 Checking provisioning prerequisites...\n");

    let mut all_ok = true;

    print!("• Checking privileges... ");
    if is_root() {
        println!("✓ Running as root");
    } else {
        println!("✗ Not running as root (cryptsetup, apt-get, and systemctl need it)");
        all_ok = false;
    }

    let tools: &[(&str, &[&str], &str)] = &[
        ("cryptsetup", &["--version"], "apt-get install cryptsetup"),
        ("docker", &["info"], "apt-get install docker.io"),
        ("systemctl", &["--version"], "systemd is required"),
        ("blkid", &["-V"], "part of util-linux"),
        ("mkfs.ext4", &["-V"], "apt-get install e2fsprogs"),
        ("curl", &["--version"], "apt-get install curl"),
    ];
    for (tool, args, hint) in tools {
        print!("• Checking {}... ", tool);
        if tool_answers(tool, args) {
            println!("✓ Available");
        } else if *tool == "docker" || *tool == "curl" {
            // Installed by the packages step; absence is not fatal up front.
            println!("○ Not found (installed during `vaulthost up`)");
        } else {
            println!("✗ Not found ({})", hint);
            all_ok = false;
        }
    }

    print!("• Checking free space for the backing file... ");
    let parent = config
        .volume
        .backing_file
        .parent()
        .unwrap_or(std::path::Path::new("/"));
    match free_space_bytes(parent) {
        Some(avail) => {
            let needed = config.volume.size_gib.unwrap_or(0) << 30;
            if needed == 0 {
                println!("✓ {} GiB free (size not configured yet)", avail >> 30);
            } else if avail > needed {
                println!("✓ {} GiB free, {} GiB needed", avail >> 30, needed >> 30);
            } else {
                println!("✗ {} GiB free, {} GiB needed", avail >> 30, needed >> 30);
                all_ok = false;
            }
        }
        None => println!("○ Could not determine free space"),
    }

    println!();
    if all_ok {
        println!("✅ All checks passed! You're ready to run: vaulthost up --container-size-gb <N>");
    } else {
        println!("⚠️  Some checks failed. Fix the issues above before running vaulthost up");
        std::process::exit(1);
    }
}

fn tool_answers(tool: &str, args: &[&str]) -> bool {
    Command::new(tool)
        .args(args)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
fn is_root() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| real_uid(&status))
        == Some(0)
}

#[cfg(not(target_os = "linux"))]
fn is_root() -> bool {
    false
}

/// Real uid from the `Uid:` line of a `/proc/<pid>/status` file. The line
/// carries real, effective, saved, and filesystem uids; the first is the
/// one that matters for the tools invoked here.
fn real_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|fields| fields.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}

/// Free bytes on the filesystem holding `path`, via `df` so no extra
/// platform crate is needed.
fn free_space_bytes(path: &std::path::Path) -> Option<u64> {
    let probe = if path.exists() {
        path
    } else {
        std::path::Path::new("/")
    };
    let output = Command::new("df")
        .args(["-B1", "--output=avail"])
        .arg(probe)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .nth(1)?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_uid_reads_the_first_uid_field() {
        let status = "Name:\tvaulthost\nUid:\t1000\t1000\t1000\t1000\nGid:\t1000\t1000\t1000\t1000\n";
        assert_eq!(real_uid(status), Some(1000));

        let root = "Uid:\t0\t0\t0\t0\n";
        assert_eq!(real_uid(root), Some(0));
    }

    #[test]
    fn real_uid_tolerates_a_malformed_status() {
        assert_eq!(real_uid(""), None);
        assert_eq!(real_uid("Name:\tvaulthost\n"), None);
        assert_eq!(real_uid("Uid:\n"), None);
    }
}
