/// Deterministic allocation failure schedule.
///
/// The next `succeed` requests go through, then `fail` requests are refused,
/// after which the plan is spent and everything succeeds again.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FailurePlan {
    pub succeed: usize,
    pub fail: usize,
}

impl FailurePlan {
    /// Refuse every request after the next `succeed` ones.
    #[must_use]
    pub const fn after(succeed: usize) -> Self {
        Self {
            succeed,
            fail: usize::MAX,
        }
    }

    /// Refuse the next `fail` requests, then recover.
    #[must_use]
    pub const fn transient(fail: usize) -> Self {
        Self { succeed: 0, fail }
    }
}

#[derive(Debug, Default)]
pub struct FailureInjector {
    plan: Option<FailurePlan>,
}

impl FailureInjector {
    pub const fn arm(&mut self, plan: FailurePlan) {
        self.plan = Some(plan);
    }

    pub const fn disarm(&mut self) {
        self.plan = None;
    }

    /// Consumes one step of the plan.
    pub fn should_fail(&mut self) -> bool {
        let Some(mut plan) = self.plan else {
            return false;
        };
        let fail = if plan.succeed > 0 {
            plan.succeed -= 1;
            false
        } else if plan.fail > 0 {
            plan.fail -= 1;
            true
        } else {
            false
        };
        self.plan = (plan.succeed > 0 || plan.fail > 0).then_some(plan);
        fail
    }
}
