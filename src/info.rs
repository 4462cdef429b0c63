//! Counters and phase timers accumulated while generating a raw chain.

use std::ops::AddAssign;

use crate::comm::Communicator;

/// Per-chain bookkeeping: how often the target was called, how often DR
/// kicked in, how much wall clock each phase consumed.
///
/// Infos aggregate by field-wise summation, both locally (`+=`) and across
/// ranks ([`RawChainInfo::mpi_sum`]).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawChainInfo {
    pub run_time: f64,
    pub candidate_run_time: f64,
    pub target_run_time: f64,
    pub mh_alpha_run_time: f64,
    pub dr_alpha_run_time: f64,
    pub dr_run_time: f64,
    pub am_run_time: f64,

    pub num_target_calls: u64,
    pub num_drs: u64,
    pub num_out_of_target_support: u64,
    pub num_out_of_target_support_in_dr: u64,
    pub num_rejections: u64,
}

impl RawChainInfo {
    pub fn reset(&mut self) {
        *self = RawChainInfo::default();
    }

    /// Sums counters and timers across all ranks of `comm`; every rank
    /// receives the totals.
    pub fn mpi_sum<C: Communicator>(&self, comm: &C) -> RawChainInfo {
        let counters = comm.sum_reduce_u64(&[
            self.num_target_calls,
            self.num_drs,
            self.num_out_of_target_support,
            self.num_out_of_target_support_in_dr,
            self.num_rejections,
        ]);
        let timers = comm.sum_reduce_f64(&[
            self.run_time,
            self.candidate_run_time,
            self.target_run_time,
            self.mh_alpha_run_time,
            self.dr_alpha_run_time,
            self.dr_run_time,
            self.am_run_time,
        ]);
        RawChainInfo {
            run_time: timers[0],
            candidate_run_time: timers[1],
            target_run_time: timers[2],
            mh_alpha_run_time: timers[3],
            dr_alpha_run_time: timers[4],
            dr_run_time: timers[5],
            am_run_time: timers[6],
            num_target_calls: counters[0],
            num_drs: counters[1],
            num_out_of_target_support: counters[2],
            num_out_of_target_support_in_dr: counters[3],
            num_rejections: counters[4],
        }
    }
}

impl AddAssign<&RawChainInfo> for RawChainInfo {
    fn add_assign(&mut self, rhs: &RawChainInfo) {
        self.run_time += rhs.run_time;
        self.candidate_run_time += rhs.candidate_run_time;
        self.target_run_time += rhs.target_run_time;
        self.mh_alpha_run_time += rhs.mh_alpha_run_time;
        self.dr_alpha_run_time += rhs.dr_alpha_run_time;
        self.dr_run_time += rhs.dr_run_time;
        self.am_run_time += rhs.am_run_time;
        self.num_target_calls += rhs.num_target_calls;
        self.num_drs += rhs.num_drs;
        self.num_out_of_target_support += rhs.num_out_of_target_support;
        self.num_out_of_target_support_in_dr += rhs.num_out_of_target_support_in_dr;
        self.num_rejections += rhs.num_rejections;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{SelfComm, ThreadComm};

    fn sample_info(scale: u64) -> RawChainInfo {
        RawChainInfo {
            run_time: scale as f64 * 0.5,
            num_target_calls: 10 * scale,
            num_drs: 2 * scale,
            num_rejections: 3 * scale,
            ..RawChainInfo::default()
        }
    }

    #[test]
    fn add_assign_is_field_wise() {
        let mut total = sample_info(1);
        total += &sample_info(2);
        assert_eq!(total.num_target_calls, 30);
        assert_eq!(total.num_drs, 6);
        assert_eq!(total.num_rejections, 9);
        assert_eq!(total.run_time, 1.5);
    }

    #[test]
    fn reset_zeroes_everything() {
        let mut info = sample_info(4);
        info.reset();
        assert_eq!(info, RawChainInfo::default());
    }

    #[test]
    fn self_comm_sum_is_identity() {
        let info = sample_info(3);
        assert_eq!(info.mpi_sum(&SelfComm), info);
    }

    /// Summing partial infos across ranks must agree with single-rank
    /// accumulation of the same events, in any grouping.
    #[test]
    fn mpi_sum_matches_local_accumulation() {
        let parts = [sample_info(1), sample_info(2), sample_info(5)];
        let mut expected = RawChainInfo::default();
        for part in &parts {
            expected += part;
        }

        let comms = ThreadComm::group(3);
        let totals: Vec<RawChainInfo> = std::thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .zip(parts.iter().cloned())
                .map(|(comm, part)| scope.spawn(move || part.mpi_sum(&comm)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for total in totals {
            assert_eq!(total, expected);
        }
    }
}
