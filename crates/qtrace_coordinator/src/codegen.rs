//! Tracing-program generation.
//!
//! Textual substitution over three templates: the collector prelude
//! (metrics struct, shared maps, counter probes), the per-OU markers
//! program (state machine plus output ring), and the common postmaster
//! probes. The substitution vocabulary is closed: SUBST_OU, SUBST_INDEX,
//! SUBST_FEATURES, SUBST_METRICS, SUBST_FIRST_FEATURE, SUBST_FIRST_METRIC,
//! SUBST_READARGS, SUBST_ACCUMULATE.

use qtrace_collector::schema::{CollectorSchema, FieldKind, OuSchema, METRIC_FIELDS};

/// Metrics excluded from accumulation: identity fields keep their
/// first-END values and end_time is overwritten.
const NO_ACCUMULATE: [&str; 4] = ["start_time", "end_time", "pid", "cpu_id"];

pub const COLLECTOR_PRELUDE_TEMPLATE: &str = r#"
#include <linux/fdtable.h>
#include <linux/fs.h>
#include <linux/net.h>
#include <linux/sched.h>
#include <linux/tcp.h>
#include <uapi/linux/bpf.h>
#include <uapi/linux/ptrace.h>

struct resource_metrics {
SUBST_METRICS
};

// Each collector needs a handle to read perf counters.
BPF_PERF_ARRAY(cpu_cycles, MAX_CPUS);
BPF_PERF_ARRAY(instructions, MAX_CPUS);
BPF_PERF_ARRAY(cache_references, MAX_CPUS);
BPF_PERF_ARRAY(cache_misses, MAX_CPUS);
BPF_PERF_ARRAY(ref_cpu_cycles, MAX_CPUS);

// Snapshots taken at BEGIN, waiting for END.
BPF_HASH(running_metrics, u64, struct resource_metrics);
// Finished pairs accumulating until FLUSH.
BPF_HASH(complete_metrics, u64, struct resource_metrics);

// plan_node_id is unique within one backend, even when OUs recurse.
static u64 collector_key(const u32 ou, const s32 plan_node_id) {
  return ((u64)ou) << 32 | (u32)plan_node_id;
}

static u64 normalized_counter(const struct bpf_perf_event_value *const value) {
  return value->counter * value->enabled / value->running;
}

static struct tcp_sock *socket_from_fd(const struct task_struct *const p, const int socket_fd) {
  struct files_struct *files = p->files;
  struct fdtable *fdt = files->fdt;
  struct file **fd_array = fdt->fd;
  struct file *fd_p = fd_array[socket_fd];
  struct socket *raw_socket = (struct socket *)fd_p->private_data;
  struct sock *raw_sock = raw_socket->sk;
  return (struct tcp_sock *)raw_sock;
}

static bool cpu_start(struct resource_metrics *const metrics) {
  const u32 cpu_k = bpf_get_smp_processor_id();
  struct bpf_perf_event_value value = {};
  if (cpu_cycles.perf_counter_value(cpu_k, &value, sizeof(value)) < 0) return false;
  metrics->cpu_cycles = normalized_counter(&value);
  if (instructions.perf_counter_value(cpu_k, &value, sizeof(value)) < 0) return false;
  metrics->instructions = normalized_counter(&value);
  if (cache_references.perf_counter_value(cpu_k, &value, sizeof(value)) < 0) return false;
  metrics->cache_references = normalized_counter(&value);
  if (cache_misses.perf_counter_value(cpu_k, &value, sizeof(value)) < 0) return false;
  metrics->cache_misses = normalized_counter(&value);
  if (ref_cpu_cycles.perf_counter_value(cpu_k, &value, sizeof(value)) < 0) return false;
  metrics->ref_cpu_cycles = normalized_counter(&value);
  return true;
}

static bool cpu_delta(u64 *const slot, const u64 end_value) {
  if (end_value < *slot) return false;
  *slot = end_value - *slot;
  return true;
}

static bool cpu_end(struct resource_metrics *const metrics) {
  const u32 cpu_k = bpf_get_smp_processor_id();
  struct bpf_perf_event_value value = {};
  if (cpu_cycles.perf_counter_value(cpu_k, &value, sizeof(value)) < 0) return false;
  if (!cpu_delta(&metrics->cpu_cycles, normalized_counter(&value))) return false;
  if (instructions.perf_counter_value(cpu_k, &value, sizeof(value)) < 0) return false;
  if (!cpu_delta(&metrics->instructions, normalized_counter(&value))) return false;
  if (cache_references.perf_counter_value(cpu_k, &value, sizeof(value)) < 0) return false;
  if (!cpu_delta(&metrics->cache_references, normalized_counter(&value))) return false;
  if (cache_misses.perf_counter_value(cpu_k, &value, sizeof(value)) < 0) return false;
  if (!cpu_delta(&metrics->cache_misses, normalized_counter(&value))) return false;
  if (ref_cpu_cycles.perf_counter_value(cpu_k, &value, sizeof(value)) < 0) return false;
  if (!cpu_delta(&metrics->ref_cpu_cycles, normalized_counter(&value))) return false;
  metrics->cpu_id = cpu_k;
  return true;
}

static void disk_start(struct resource_metrics *const metrics, const struct task_struct *const p) {
  metrics->disk_bytes_read = p->ioac.read_bytes;
  metrics->disk_bytes_written = p->ioac.write_bytes;
}

static void disk_end(struct resource_metrics *const metrics, const struct task_struct *const p) {
  metrics->disk_bytes_read = (p->ioac.read_bytes - metrics->disk_bytes_read);
  metrics->disk_bytes_written = (p->ioac.write_bytes - metrics->disk_bytes_written);
}

#ifdef CLIENT_SOCKET_FD
static void net_start(struct resource_metrics *const metrics, const struct task_struct *const p) {
  const struct tcp_sock *const tcp_socket = socket_from_fd(p, CLIENT_SOCKET_FD);
  metrics->network_bytes_read = tcp_socket->copied_seq;  // unread, not bytes_received
  metrics->network_bytes_written = tcp_socket->bytes_sent;
}

static void net_end(struct resource_metrics *const metrics, const struct task_struct *const p) {
  const struct tcp_sock *const tcp_socket = socket_from_fd(p, CLIENT_SOCKET_FD);
  metrics->network_bytes_read = tcp_socket->copied_seq - metrics->network_bytes_read;
  metrics->network_bytes_written = tcp_socket->bytes_sent - metrics->network_bytes_written;
}
#endif

// Fold one finished BEGIN/END pair into the accumulating entry.
static void accumulate(struct resource_metrics *const lhs, const struct resource_metrics *const rhs) {
  lhs->end_time = rhs->end_time;
SUBST_ACCUMULATE
}
"#;

pub const OU_MARKERS_TEMPLATE: &str = r#"
struct SUBST_OU_features_t {
SUBST_FEATURES
};

struct SUBST_OU_output {
  u32 ou_index;
SUBST_FEATURES
SUBST_METRICS
};

// Features keyed by plan node alone, held until flush.
BPF_HASH(SUBST_OU_features_map, s32, struct SUBST_OU_features_t);
// Feature payloads are variable width; stage them in a singleton array
// rather than the stack.
BPF_ARRAY(SUBST_OU_features_scratch, struct SUBST_OU_features_t, 1);
BPF_ARRAY(SUBST_OU_output_scratch, struct SUBST_OU_output, 1);
BPF_PERF_OUTPUT(collector_results_SUBST_INDEX);

static void SUBST_OU_reset(const s32 plan_node_id) {
  u64 key = collector_key(SUBST_INDEX, plan_node_id);
  running_metrics.delete(&key);
  complete_metrics.delete(&key);
  SUBST_OU_features_map.delete(&plan_node_id);
}

void SUBST_OU_begin(struct pt_regs *ctx) {
  s32 plan_node_id = 0;
  bpf_usdt_readarg(1, ctx, &plan_node_id);
  struct resource_metrics metrics = {};

  if (!cpu_start(&metrics)) {
    SUBST_OU_reset(plan_node_id);
    return;
  }
  struct task_struct *p = (struct task_struct *)bpf_get_current_task();
  disk_start(&metrics, p);
#ifdef CLIENT_SOCKET_FD
  net_start(&metrics, p);
#endif

  // Start time after the probes, nanoseconds shifted to microseconds.
  metrics.start_time = (bpf_ktime_get_ns() >> 10);
  metrics.pid = bpf_get_current_pid_tgid() >> 32;

  u64 key = collector_key(SUBST_INDEX, plan_node_id);
  running_metrics.update(&key, &metrics);
}

void SUBST_OU_end(struct pt_regs *ctx) {
  s32 plan_node_id = 0;
  bpf_usdt_readarg(1, ctx, &plan_node_id);
  u64 key = collector_key(SUBST_INDEX, plan_node_id);

  struct resource_metrics *metrics = running_metrics.lookup(&key);
  if (metrics == NULL) {
    SUBST_OU_reset(plan_node_id);
    return;
  }

  metrics->end_time = (bpf_ktime_get_ns() >> 10);
  metrics->elapsed_us = (metrics->end_time - metrics->start_time);

  if (!cpu_end(metrics)) {
    SUBST_OU_reset(plan_node_id);
    return;
  }
  struct task_struct *p = (struct task_struct *)bpf_get_current_task();
  disk_end(metrics, p);
#ifdef CLIENT_SOCKET_FD
  net_end(metrics, p);
#endif

  struct resource_metrics *complete = complete_metrics.lookup(&key);
  if (complete == NULL) {
    complete_metrics.update(&key, metrics);
  } else {
    accumulate(complete, metrics);
  }
  running_metrics.delete(&key);
}

void SUBST_OU_features(struct pt_regs *ctx) {
  s32 plan_node_id = 0;
  bpf_usdt_readarg(1, ctx, &plan_node_id);

  int zero = 0;
  struct SUBST_OU_features_t *features = SUBST_OU_features_scratch.lookup(&zero);
  if (features == NULL) {
    return;
  }
SUBST_READARGS
  SUBST_OU_features_map.update(&plan_node_id, features);
}

void SUBST_OU_flush(struct pt_regs *ctx) {
  s32 plan_node_id = 0;
  bpf_usdt_readarg(1, ctx, &plan_node_id);
  u64 key = collector_key(SUBST_INDEX, plan_node_id);

  struct SUBST_OU_features_t *features = SUBST_OU_features_map.lookup(&plan_node_id);
  struct resource_metrics *metrics = complete_metrics.lookup(&key);
  if (features == NULL || metrics == NULL) {
    SUBST_OU_reset(plan_node_id);
    return;
  }

  int zero = 0;
  struct SUBST_OU_output *output = SUBST_OU_output_scratch.lookup(&zero);
  if (output == NULL) {
    SUBST_OU_reset(plan_node_id);
    return;
  }
  output->ou_index = SUBST_INDEX;
  __builtin_memcpy(&(output->SUBST_FIRST_FEATURE), features, sizeof(struct SUBST_OU_features_t));
  __builtin_memcpy(&(output->SUBST_FIRST_METRIC), metrics, sizeof(struct resource_metrics));

  collector_results_SUBST_INDEX.perf_submit(ctx, output, sizeof(struct SUBST_OU_output));
  SUBST_OU_reset(plan_node_id);
}
"#;

pub const COMMON_PROBES_TEMPLATE: &str = r#"
BPF_PERF_OUTPUT(postmaster_events);

struct postmaster_event_t {
  int type_;
  int pid_;
  int socket_fd_;
};

void postmaster_fork_backend(struct pt_regs *ctx) {
  struct postmaster_event_t event = {.type_ = 0};
  bpf_usdt_readarg(1, ctx, &(event.pid_));
  bpf_usdt_readarg(2, ctx, &(event.socket_fd_));
  postmaster_events.perf_submit(ctx, &event, sizeof(event));
}

void postmaster_fork_background(struct pt_regs *ctx) {
  struct postmaster_event_t event = {.type_ = 1};
  bpf_usdt_readarg(1, ctx, &(event.pid_));
  postmaster_events.perf_submit(ctx, &event, sizeof(event));
}

void postmaster_reap_backend(struct pt_regs *ctx) {
  struct postmaster_event_t event = {.type_ = 2};
  bpf_usdt_readarg(1, ctx, &(event.pid_));
  postmaster_events.perf_submit(ctx, &event, sizeof(event));
}

void postmaster_reap_background(struct pt_regs *ctx) {
  struct postmaster_event_t event = {.type_ = 3};
  bpf_usdt_readarg(1, ctx, &(event.pid_));
  postmaster_events.perf_submit(ctx, &event, sizeof(event));
}
"#;

fn c_type(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Bool => "u8",
        FieldKind::Int16 => "s16",
        FieldKind::Int32 => "s32",
        FieldKind::Int64 => "s64",
        FieldKind::UInt32 => "u32",
        FieldKind::UInt64 => "u64",
        // Doubles travel as raw 64-bit words; the consumer reinterprets.
        FieldKind::Float64 => "u64",
        FieldKind::Opaque => "u64",
        FieldKind::ListLen => "s32",
    }
}

fn features_struct(ou: &OuSchema) -> String {
    ou.features
        .iter()
        .map(|field| format!("  {} {};", c_type(field.kind), field.name))
        .collect::<Vec<_>>()
        .join("\n")
}

fn metrics_struct() -> String {
    METRIC_FIELDS
        .iter()
        .map(|(name, kind)| format!("  {} {};", c_type(*kind), name))
        .collect::<Vec<_>>()
        .join("\n")
}

fn metrics_accumulate() -> String {
    METRIC_FIELDS
        .iter()
        .filter(|(name, _)| !NO_ACCUMULATE.contains(name))
        .map(|(name, _)| format!("  lhs->{name} += rhs->{name};"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The marker argument layout is fixed: plan_node_id, query_id, a pointer
/// to the node struct, child ids, statement start. The node struct is
/// copied en bloc through the pointer; everything else reads by value.
fn generate_readargs(ou: &OuSchema) -> String {
    let struct_first = ou
        .features
        .get(1)
        .map(|field| field.name.as_str())
        .unwrap_or("query_id");
    let tail = ou.features.len().saturating_sub(3);
    let struct_width: usize = ou.features[1..tail]
        .iter()
        .map(|field| field.kind.wire_size())
        .sum();
    format!(
        "  bpf_usdt_readarg(2, ctx, &(features->query_id));\n\
         \x20 bpf_usdt_readarg_p(3, ctx, &(features->{struct_first}), {struct_width});\n\
         \x20 bpf_usdt_readarg(4, ctx, &(features->left_child_plan_node_id));\n\
         \x20 bpf_usdt_readarg(5, ctx, &(features->right_child_plan_node_id));\n\
         \x20 bpf_usdt_readarg(6, ctx, &(features->statement_start_ts));"
    )
}

fn generate_ou_program(ou: &OuSchema) -> String {
    OU_MARKERS_TEMPLATE
        .replace("SUBST_READARGS", &generate_readargs(ou))
        .replace("SUBST_FEATURES", &features_struct(ou))
        .replace(
            "SUBST_FIRST_FEATURE",
            ou.features
                .first()
                .map(|field| field.name.as_str())
                .unwrap_or("query_id"),
        )
        .replace("SUBST_INDEX", &ou.ou_index.to_string())
        .replace("SUBST_OU", &ou.name)
}

/// Generate the complete tracing program for one backend attach.
pub fn generate_collector_program(
    schema: &CollectorSchema,
    max_cpus: usize,
    client_socket_fd: Option<i32>,
) -> String {
    let mut program = String::new();
    if let Some(fd) = client_socket_fd {
        program.push_str(&format!("#define CLIENT_SOCKET_FD {fd}\n"));
    }
    program.push_str(COLLECTOR_PRELUDE_TEMPLATE);
    program.push_str(COMMON_PROBES_TEMPLATE);
    for ou in &schema.ous {
        program.push_str(&generate_ou_program(ou));
    }
    let first_metric = METRIC_FIELDS.first().map(|(name, _)| *name).unwrap_or("");
    program
        .replace("SUBST_METRICS", &metrics_struct())
        .replace("SUBST_ACCUMULATE", &metrics_accumulate())
        .replace("SUBST_FIRST_METRIC", first_metric)
        .replace("MAX_CPUS", &max_cpus.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decls::build_schema;
    use qtrace_server::plan::OU_DECLARATIONS;

    fn program() -> String {
        let schema = build_schema(OU_DECLARATIONS).unwrap();
        generate_collector_program(&schema, 8, None)
    }

    #[test]
    fn substitution_vocabulary_is_fully_consumed() {
        let program = program();
        assert!(
            !program.contains("SUBST_"),
            "unresolved substitution placeholders remain"
        );
        assert!(!program.contains("MAX_CPUS"));
    }

    #[test]
    fn every_ou_gets_a_state_machine_and_ring() {
        let program = program();
        for (index, (function, _)) in crate::decls::OU_DEFS.iter().enumerate() {
            assert!(program.contains(&format!("void {function}_begin(struct pt_regs *ctx)")));
            assert!(program.contains(&format!("void {function}_flush(struct pt_regs *ctx)")));
            assert!(program.contains(&format!("collector_results_{index}")));
        }
    }

    #[test]
    fn accumulate_skips_identity_metrics() {
        let accumulate = metrics_accumulate();
        assert!(accumulate.contains("lhs->instructions += rhs->instructions;"));
        assert!(!accumulate.contains("lhs->pid"));
        assert!(!accumulate.contains("lhs->cpu_id"));
        assert!(!accumulate.contains("lhs->start_time"));
        assert!(!accumulate.contains("lhs->end_time"));
    }

    #[test]
    fn socket_fd_define_is_emitted_when_present() {
        let schema = build_schema(OU_DECLARATIONS).unwrap();
        let with_fd = generate_collector_program(&schema, 4, Some(17));
        assert!(with_fd.starts_with("#define CLIENT_SOCKET_FD 17\n"));
        let without = generate_collector_program(&schema, 4, None);
        assert!(!without.contains("#define CLIENT_SOCKET_FD"));
    }

    #[test]
    fn readargs_copy_the_node_struct_en_bloc() {
        let schema = build_schema(OU_DECLARATIONS).unwrap();
        let seq_scan = schema.ous.iter().find(|ou| ou.name == "ExecSeqScan").unwrap();
        let readargs = generate_readargs(seq_scan);
        assert!(readargs.contains("bpf_usdt_readarg_p(3, ctx, &(features->SeqScan_scan_plan_plan_node_id)"));
        assert!(readargs.contains("bpf_usdt_readarg(6, ctx, &(features->statement_start_ts))"));
    }
}
