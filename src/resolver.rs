//! Dependency resolution.
//!
//! Expands a submission into every combination of upstream submissions it
//! must be evaluated against: one eligible-id list per declared dependency,
//! then the cartesian product of those lists in declaration order.

use std::collections::HashMap;

use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::store::{
    DataStore, InputType, QuestionDependency, Roster, Submission, SubmissionId, UserId,
};

/// Upstream submission ids for one Result, one per dependency, in
/// dependency order.
pub type UpstreamSet = Vec<SubmissionId>;

/// Producer submissions a dependency admits.
///
/// Keeps non-disabled submissions to the producer question whose submitter
/// matches the dependency's policy. For [`InputType::Latest`] only each
/// user's most recent one survives, ordered newest first.
pub fn eligible_submissions(
    dependency: &QuestionDependency,
    submissions: &[Submission],
    roster: &Roster,
) -> Vec<SubmissionId> {
    let admitted = submissions.iter().filter(|s| {
        !s.disabled
            && s.question_id == dependency.producer_id
            && roster.admits(dependency.submitters, s.user_id)
    });

    match dependency.input_type {
        InputType::All => admitted.map(|s| s.id).collect(),
        InputType::Latest => {
            let mut latest: HashMap<UserId, &Submission> = HashMap::new();
            for submission in admitted {
                latest
                    .entry(submission.user_id)
                    .and_modify(|current| {
                        if (submission.timestamp, submission.id) > (current.timestamp, current.id) {
                            *current = submission;
                        }
                    })
                    .or_insert(submission);
            }
            let mut picked: Vec<&Submission> = latest.into_values().collect();
            picked.sort_by(|a, b| (b.timestamp, b.id).cmp(&(a.timestamp, a.id)));
            picked.into_iter().map(|s| s.id).collect()
        }
    }
}

/// Every way of choosing one id from each list, in list order.
///
/// No lists yields a single empty set; any empty list yields no sets.
pub fn cartesian_product(lists: &[Vec<SubmissionId>]) -> Vec<UpstreamSet> {
    lists.iter().fold(vec![Vec::new()], |sets, list| {
        sets.iter()
            .flat_map(|prefix| {
                list.iter().map(move |id| {
                    let mut set = Vec::with_capacity(prefix.len() + 1);
                    set.extend_from_slice(prefix);
                    set.push(*id);
                    set
                })
            })
            .collect()
    })
}

/// Upstream sets for `submission_id` given the store's current contents.
#[instrument(skip(store))]
pub async fn upstream_id_sets<S: DataStore + ?Sized>(
    store: &S,
    submission_id: SubmissionId,
) -> Result<Vec<UpstreamSet>> {
    let submission = store
        .submission(submission_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("submission {submission_id}")))?;
    let question = store
        .question(submission.question_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("question {}", submission.question_id)))?;

    let dependencies = store.dependencies(question.id).await?;
    if dependencies.is_empty() {
        return Ok(vec![Vec::new()]);
    }

    let roster = store.roster(question.course_id).await?;
    let mut lists = Vec::with_capacity(dependencies.len());
    for dependency in &dependencies {
        let submissions = store.active_submissions(dependency.producer_id).await?;
        let eligible = eligible_submissions(dependency, &submissions, &roster);
        debug!(
            producer = dependency.producer_id,
            input_type = %dependency.input_type,
            submitters = %dependency.submitters,
            eligible = eligible.len(),
            "Resolved dependency"
        );
        if eligible.is_empty() {
            info!(
                producer = dependency.producer_id,
                "No eligible upstream submissions; nothing to evaluate"
            );
        }
        lists.push(eligible);
    }

    Ok(cartesian_product(&lists))
}
