//! Human-readable plan formatting.

use vmplan_core::GIB;
use vmplan_placement::{MigrationPlan, MoveKind};

fn gib(bytes: u64) -> f64 {
    bytes as f64 / GIB as f64
}

pub fn format_plan(plan: &MigrationPlan) -> String {
    let mut out = String::new();
    let totals = &plan.totals;

    out.push_str("\n╔══════════════════════════════════════════╗\n");
    out.push_str("║  vmplan Migration Plan                   ║\n");
    out.push_str("╠══════════════════════════════════════════╣\n");
    out.push_str(&format!("║  Mode:     {:<30}║\n", plan.mode));
    out.push_str(&format!("║  VMs:      {:<30}║\n", totals.vms));
    out.push_str(&format!("║  vCPUs:    {:<30}║\n", totals.vcpus));
    out.push_str(&format!("║  RAM:      {:<30}║\n", format!("{:.1} GiB", gib(totals.ram_bytes))));
    out.push_str(&format!("║  Storage:  {:<30}║\n", format!("{:.1} GiB", gib(totals.storage_bytes))));
    out.push_str("╚══════════════════════════════════════════╝\n\n");

    out.push_str(&format!("{}\n", plan.improvement_text));
    if let Some(summary) = &plan.balance {
        out.push_str(&format!(
            "Balance: {:?} after {} iteration(s), {} migration(s), {} swap(s)\n",
            summary.outcome, summary.iterations, summary.migrations, summary.swaps
        ));
    }
    out.push('\n');

    if plan.suggestions.is_empty() {
        out.push_str("No migrations suggested.\n\n");
    } else {
        out.push_str(&format!("MIGRATIONS ({}):\n\n", plan.suggestions.len()));
        out.push_str(&format!(
            "  {:<6} {:<20} {:>5} {:>9}  {:<12} {:<12} {}\n",
            "ID", "NAME", "vCPU", "RAM", "FROM", "TO", "KIND"
        ));
        for s in &plan.suggestions {
            let kind = match (s.kind, s.group) {
                (MoveKind::Migrate, _) => "migrate".to_string(),
                (MoveKind::Swap, Some(g)) => format!("swap #{g}"),
                (MoveKind::MultiSwap, Some(g)) => format!("multi-swap #{g}"),
                (MoveKind::Swap, None) => "swap".to_string(),
                (MoveKind::MultiSwap, None) => "multi-swap".to_string(),
            };
            out.push_str(&format!(
                "  {:<6} {:<20} {:>5} {:>7.1}G  {:<12} {:<12} {}\n",
                s.vm.id,
                s.vm.name,
                s.vm.vcpus,
                s.vm.ram_gib(),
                s.source,
                s.target,
                kind
            ));
            out.push_str(&format!("         {}\n", s.reason));
        }
        out.push('\n');
    }

    if !plan.host_states.is_empty() {
        out.push_str("HOSTS (before → after):\n\n");
        for h in &plan.host_states {
            out.push_str(&format!(
                "  {:<12} CPU {:>5.1}% → {:>5.1}%   RAM {:>5.1}% → {:>5.1}%   Storage {:>5.1}% → {:>5.1}%   VMs {} → {}\n",
                h.host,
                h.before.cpu_percent(),
                h.after.cpu_percent(),
                h.before.ram_percent(),
                h.after.ram_percent(),
                h.before.storage_percent(),
                h.after.storage_percent(),
                h.before.vm_count,
                h.after.vm_count
            ));
        }
        out.push('\n');
    }

    if !plan.unplaced.is_empty() {
        out.push_str("❌ CANNOT MIGRATE:\n\n");
        for u in &plan.unplaced {
            out.push_str(&format!("  • {} ({}): {}\n", u.vm_id, u.vm_name, u.reason));
        }
        out.push('\n');
    }

    if !plan.anomalies.is_empty() {
        out.push_str("⚠️  ANOMALIES:\n\n");
        for a in &plan.anomalies {
            out.push_str(&format!("  • {a}\n"));
        }
        out.push('\n');
    }

    out
}
