//! Link shaping via `tc netem`.

use std::io;

use netlab_harness::spec::LinkSpec;

use crate::namespace::Namespace;

/// Apply a group's link shaping to an interface inside a namespace.
///
/// Removes any existing root qdisc first, then installs netem with the
/// requested delay, loss, and rate. A spec with no parameters set just
/// clears existing shaping.
pub fn apply_link_shaping(ns: &Namespace, interface: &str, spec: &LinkSpec) -> io::Result<()> {
    let _ = ns.exec("tc", &["qdisc", "del", "dev", interface, "root"]);

    if spec.delay_ms.is_none() && spec.loss_percent.is_none() && spec.rate_kbit.is_none() {
        return Ok(());
    }

    let mut args_storage: Vec<String> = vec![
        "qdisc".into(),
        "add".into(),
        "dev".into(),
        interface.into(),
        "root".into(),
        "netem".into(),
    ];
    if let Some(delay) = spec.delay_ms {
        args_storage.push("delay".into());
        args_storage.push(format!("{delay}ms"));
    }
    if let Some(loss) = spec.loss_percent {
        args_storage.push("loss".into());
        args_storage.push(format!("{loss}%"));
    }
    if let Some(rate) = spec.rate_kbit {
        args_storage.push("rate".into());
        args_storage.push(format!("{rate}kbit"));
    }

    let args: Vec<&str> = args_storage.iter().map(|s| s.as_str()).collect();
    let output = ns.exec("tc", &args)?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "failed to apply tc netem: {}\ncommand: tc {}",
            String::from_utf8_lossy(&output.stderr),
            args.join(" ")
        )));
    }
    Ok(())
}
