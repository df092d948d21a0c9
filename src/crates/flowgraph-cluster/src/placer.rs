//! Partitions local CPUs into buckets and pins tasks onto them.

use flowgraph_protocol::TaskId;
use std::collections::HashSet;

#[derive(Debug)]
struct Bucket {
    cpu: u32,
    tasks: HashSet<TaskId>,
}

/// Assigns each task a disjoint-ish set of CPU buckets; the bucket ids
/// become the task's `cpuset.cpus` value.
#[derive(Debug, Default)]
pub struct Placer {
    buckets: Vec<Bucket>,
}

impl Placer {
    pub fn new(num_cpus: u32) -> Self {
        Self {
            buckets: (0..num_cpus)
                .map(|cpu| Bucket {
                    cpu,
                    tasks: HashSet::new(),
                })
                .collect(),
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Pick the `count` least-loaded buckets for `task`.
    pub fn assign(&mut self, task: TaskId, count: usize) -> Vec<u32> {
        let count = count.clamp(1, self.buckets.len().max(1));
        let mut order: Vec<usize> = (0..self.buckets.len()).collect();
        order.sort_by_key(|idx| (self.buckets[*idx].tasks.len(), self.buckets[*idx].cpu));

        let mut cpus = Vec::with_capacity(count);
        for idx in order.into_iter().take(count) {
            self.buckets[idx].tasks.insert(task);
            cpus.push(self.buckets[idx].cpu);
        }
        cpus.sort_unstable();
        cpus
    }

    /// Release every bucket the task held.
    pub fn release(&mut self, task: &TaskId) {
        for bucket in &mut self.buckets {
            bucket.tasks.remove(task);
        }
    }

    /// Render a bucket list the way `cpuset.cpus` expects it.
    pub fn cpuset_string(cpus: &[u32]) -> String {
        cpus.iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_prefers_idle_buckets() {
        let mut placer = Placer::new(4);
        let a = TaskId::new(1, 0);
        let b = TaskId::new(1, 1);

        let cpus_a = placer.assign(a, 2);
        let cpus_b = placer.assign(b, 2);
        assert_eq!(cpus_a.len(), 2);
        assert_eq!(cpus_b.len(), 2);
        // With four idle buckets the two tasks must not overlap.
        assert!(cpus_a.iter().all(|c| !cpus_b.contains(c)));
    }

    #[test]
    fn release_frees_buckets_for_reuse() {
        let mut placer = Placer::new(2);
        let a = TaskId::new(2, 0);
        let cpus_a = placer.assign(a, 2);
        placer.release(&a);

        let b = TaskId::new(2, 1);
        let cpus_b = placer.assign(b, 2);
        assert_eq!(cpus_a, cpus_b);
    }

    #[test]
    fn oversized_requests_are_clamped() {
        let mut placer = Placer::new(2);
        let cpus = placer.assign(TaskId::new(3, 0), 16);
        assert_eq!(cpus, vec![0, 1]);
        assert_eq!(Placer::cpuset_string(&cpus), "0,1");
    }
}
