// SPDX-License-Identifier: MIT OR Apache-2.0

use sqlx::{FromRow, query, query_as, query_scalar};
use tessera_store::{SqliteStore, StoreError, Timestamp};

use crate::groups::{GroupId, decode};
use crate::items::ItemId;
use crate::results::aggregation::Aggregate;
use crate::results::{
    Answer, AnswerId, Attempt, AttemptId, Grading, ItemResult, PropagationState, ScoreEditRule,
};

/// Store API for attempts, results, answers and their gradings.
pub trait ResultStore {
    /// Identifier following the highest attempt id of `participant`, starting at 0.
    fn next_attempt_id(
        &self,
        participant: GroupId,
    ) -> impl Future<Output = Result<AttemptId, StoreError>>;

    fn insert_attempt(&self, attempt: &Attempt) -> impl Future<Output = Result<(), StoreError>>;

    fn attempt(
        &self,
        participant: GroupId,
        id: AttemptId,
    ) -> impl Future<Output = Result<Option<Attempt>, StoreError>>;

    /// Inserts a zero-valued result, returning `false` if it already exists.
    fn insert_result(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        item: ItemId,
        state: PropagationState,
        now: Timestamp,
    ) -> impl Future<Output = Result<bool, StoreError>>;

    fn result(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        item: ItemId,
    ) -> impl Future<Output = Result<Option<ItemResult>, StoreError>>;

    /// All results of `participant` on `item`, across attempts.
    fn results_of(
        &self,
        participant: GroupId,
        item: ItemId,
    ) -> impl Future<Output = Result<Vec<ItemResult>, StoreError>>;

    fn results_in_state(
        &self,
        state: PropagationState,
    ) -> impl Future<Output = Result<Vec<ItemResult>, StoreError>>;

    fn set_propagation_state(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        item: ItemId,
        state: PropagationState,
    ) -> impl Future<Output = Result<(), StoreError>>;

    fn write_aggregate(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        item: ItemId,
        aggregate: &Aggregate,
        state: PropagationState,
    ) -> impl Future<Output = Result<(), StoreError>>;

    fn set_score_edit_rule(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        item: ItemId,
        rule: Option<(ScoreEditRule, f64)>,
    ) -> impl Future<Output = Result<bool, StoreError>>;

    fn touch_result(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        item: ItemId,
        now: Timestamp,
    ) -> impl Future<Output = Result<(), StoreError>>;

    /// Results on `child` which feed the result of `attempt` on the parent item: the ones of
    /// `attempt` itself and the ones of attempts started for `child` below `attempt`.
    fn linked_child_results(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        child: ItemId,
    ) -> impl Future<Output = Result<Vec<ItemResult>, StoreError>>;

    /// Marks settled results on `item` as `state`, returning the number of marked rows.
    fn mark_item_results(
        &self,
        item: ItemId,
        state: PropagationState,
    ) -> impl Future<Output = Result<u64, StoreError>>;

    /// Marks settled results on children of `item` of participants below `group` to be
    /// propagated, returning the number of marked rows.
    fn mark_child_results_below(
        &self,
        group: GroupId,
        item: ItemId,
        now: Timestamp,
    ) -> impl Future<Output = Result<u64, StoreError>>;

    fn insert_answer(&self, answer: &Answer) -> impl Future<Output = Result<(), StoreError>>;

    fn answer(&self, id: AnswerId) -> impl Future<Output = Result<Option<Answer>, StoreError>>;

    /// Answers of a result together with their grading, oldest first.
    fn graded_answers(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        item: ItemId,
    ) -> impl Future<Output = Result<Vec<(Answer, Option<Grading>)>, StoreError>>;

    fn grading(&self, answer: AnswerId) -> impl Future<Output = Result<Option<Grading>, StoreError>>;

    fn insert_grading(&self, grading: &Grading) -> impl Future<Output = Result<(), StoreError>>;
}

const RESULT_COLUMNS: &str = "
    results.participant_id,
    results.attempt_id,
    results.item_id,
    results.score_computed,
    results.score_obtained_at,
    results.validated_at,
    results.score_edit_rule,
    results.score_edit_value,
    results.tasks_tried,
    results.latest_activity_at,
    results.propagation_state
";

#[derive(FromRow)]
struct AttemptRow {
    participant_id: GroupId,
    id: AttemptId,
    root_item_id: Option<ItemId>,
    parent_attempt_id: Option<AttemptId>,
    created_at: Timestamp,
}

impl From<AttemptRow> for Attempt {
    fn from(row: AttemptRow) -> Self {
        Attempt {
            participant: row.participant_id,
            id: row.id,
            root_item: row.root_item_id,
            parent_attempt: row.parent_attempt_id,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct ResultRow {
    participant_id: GroupId,
    attempt_id: AttemptId,
    item_id: ItemId,
    score_computed: f64,
    score_obtained_at: Option<Timestamp>,
    validated_at: Option<Timestamp>,
    score_edit_rule: Option<String>,
    score_edit_value: Option<f64>,
    tasks_tried: i64,
    latest_activity_at: Timestamp,
    propagation_state: String,
}

impl TryFrom<ResultRow> for ItemResult {
    type Error = StoreError;

    fn try_from(row: ResultRow) -> Result<Self, Self::Error> {
        let score_edit_rule = row
            .score_edit_rule
            .as_deref()
            .map(|rule| decode("score_edit_rule", rule))
            .transpose()?;

        Ok(ItemResult {
            participant: row.participant_id,
            attempt: row.attempt_id,
            item: row.item_id,
            score_computed: row.score_computed,
            score_obtained_at: row.score_obtained_at,
            validated_at: row.validated_at,
            score_edit_rule,
            score_edit_value: row.score_edit_value,
            tasks_tried: row.tasks_tried,
            latest_activity_at: row.latest_activity_at,
            propagation_state: decode("propagation_state", &row.propagation_state)?,
        })
    }
}

fn into_results(rows: Vec<ResultRow>) -> Result<Vec<ItemResult>, StoreError> {
    rows.into_iter().map(ItemResult::try_from).collect()
}

#[derive(FromRow)]
struct AnswerRow {
    id: AnswerId,
    participant_id: GroupId,
    attempt_id: AttemptId,
    item_id: ItemId,
    author_id: GroupId,
    answer: String,
    submitted_at: Timestamp,
}

impl From<AnswerRow> for Answer {
    fn from(row: AnswerRow) -> Self {
        Answer {
            id: row.id,
            participant: row.participant_id,
            attempt: row.attempt_id,
            item: row.item_id,
            author: row.author_id,
            answer: row.answer,
            submitted_at: row.submitted_at,
        }
    }
}

#[derive(FromRow)]
struct GradedAnswerRow {
    #[sqlx(flatten)]
    answer: AnswerRow,
    score: Option<f64>,
    graded_at: Option<Timestamp>,
}

impl ResultStore for SqliteStore {
    async fn next_attempt_id(&self, participant: GroupId) -> Result<AttemptId, StoreError> {
        let max: Option<AttemptId> = self
            .tx(async |tx| {
                Ok(
                    query_scalar("SELECT MAX(id) FROM attempts WHERE participant_id = ?")
                        .bind(participant)
                        .fetch_one(&mut **tx)
                        .await?,
                )
            })
            .await?;
        Ok(max.map_or(0, |max| max + 1))
    }

    async fn insert_attempt(&self, attempt: &Attempt) -> Result<(), StoreError> {
        self.tx(async |tx| {
            query(
                "
                INSERT INTO
                    attempts (
                        participant_id,
                        id,
                        root_item_id,
                        parent_attempt_id,
                        created_at
                    )
                VALUES
                    (?, ?, ?, ?, ?)
                ",
            )
            .bind(attempt.participant)
            .bind(attempt.id)
            .bind(attempt.root_item)
            .bind(attempt.parent_attempt)
            .bind(attempt.created_at)
            .execute(&mut **tx)
            .await?;
            Ok(())
        })
        .await
    }

    async fn attempt(
        &self,
        participant: GroupId,
        id: AttemptId,
    ) -> Result<Option<Attempt>, StoreError> {
        let row = self
            .tx(async |tx| {
                Ok(query_as::<_, AttemptRow>(
                    "
                    SELECT
                        participant_id,
                        id,
                        root_item_id,
                        parent_attempt_id,
                        created_at
                    FROM
                        attempts
                    WHERE
                        participant_id = ?
                        AND id = ?
                    ",
                )
                .bind(participant)
                .bind(id)
                .fetch_optional(&mut **tx)
                .await?)
            })
            .await?;
        Ok(row.map(Attempt::from))
    }

    async fn insert_result(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        item: ItemId,
        state: PropagationState,
        now: Timestamp,
    ) -> Result<bool, StoreError> {
        let result = self
            .tx(async |tx| {
                Ok(query(
                    "
                    INSERT INTO
                        results (
                            participant_id,
                            attempt_id,
                            item_id,
                            latest_activity_at,
                            propagation_state
                        )
                    VALUES
                        (?, ?, ?, ?, ?)
                    ON CONFLICT (participant_id, attempt_id, item_id) DO NOTHING
                    ",
                )
                .bind(participant)
                .bind(attempt)
                .bind(item)
                .bind(now)
                .bind(state.as_str())
                .execute(&mut **tx)
                .await?)
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn result(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        item: ItemId,
    ) -> Result<Option<ItemResult>, StoreError> {
        let sql = format!(
            "
            SELECT {RESULT_COLUMNS}
            FROM
                results
            WHERE
                participant_id = ?
                AND attempt_id = ?
                AND item_id = ?
            "
        );
        let row = self
            .tx(async |tx| {
                Ok(query_as::<_, ResultRow>(&sql)
                    .bind(participant)
                    .bind(attempt)
                    .bind(item)
                    .fetch_optional(&mut **tx)
                    .await?)
            })
            .await?;
        row.map(ItemResult::try_from).transpose()
    }

    async fn results_of(
        &self,
        participant: GroupId,
        item: ItemId,
    ) -> Result<Vec<ItemResult>, StoreError> {
        let sql = format!(
            "
            SELECT {RESULT_COLUMNS}
            FROM
                results
            WHERE
                participant_id = ?
                AND item_id = ?
            ORDER BY
                attempt_id
            "
        );
        let rows = self
            .tx(async |tx| {
                Ok(query_as::<_, ResultRow>(&sql)
                    .bind(participant)
                    .bind(item)
                    .fetch_all(&mut **tx)
                    .await?)
            })
            .await?;
        into_results(rows)
    }

    async fn results_in_state(
        &self,
        state: PropagationState,
    ) -> Result<Vec<ItemResult>, StoreError> {
        let sql = format!(
            "
            SELECT {RESULT_COLUMNS}
            FROM
                results
            WHERE
                propagation_state = ?
            ORDER BY
                participant_id,
                attempt_id,
                item_id
            "
        );
        let rows = self
            .tx(async |tx| {
                Ok(query_as::<_, ResultRow>(&sql)
                    .bind(state.as_str())
                    .fetch_all(&mut **tx)
                    .await?)
            })
            .await?;
        into_results(rows)
    }

    async fn set_propagation_state(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        item: ItemId,
        state: PropagationState,
    ) -> Result<(), StoreError> {
        self.tx(async |tx| {
            query(
                "
                UPDATE
                    results
                SET
                    propagation_state = ?
                WHERE
                    participant_id = ?
                    AND attempt_id = ?
                    AND item_id = ?
                ",
            )
            .bind(state.as_str())
            .bind(participant)
            .bind(attempt)
            .bind(item)
            .execute(&mut **tx)
            .await?;
            Ok(())
        })
        .await
    }

    async fn write_aggregate(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        item: ItemId,
        aggregate: &Aggregate,
        state: PropagationState,
    ) -> Result<(), StoreError> {
        self.tx(async |tx| {
            query(
                "
                UPDATE
                    results
                SET
                    score_computed = ?,
                    score_obtained_at = ?,
                    validated_at = ?,
                    tasks_tried = ?,
                    latest_activity_at = ?,
                    propagation_state = ?
                WHERE
                    participant_id = ?
                    AND attempt_id = ?
                    AND item_id = ?
                ",
            )
            .bind(aggregate.score)
            .bind(aggregate.score_obtained_at)
            .bind(aggregate.validated_at)
            .bind(aggregate.tasks_tried)
            .bind(aggregate.latest_activity_at)
            .bind(state.as_str())
            .bind(participant)
            .bind(attempt)
            .bind(item)
            .execute(&mut **tx)
            .await?;
            Ok(())
        })
        .await
    }

    async fn set_score_edit_rule(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        item: ItemId,
        rule: Option<(ScoreEditRule, f64)>,
    ) -> Result<bool, StoreError> {
        let result = self
            .tx(async |tx| {
                Ok(query(
                    "
                    UPDATE
                        results
                    SET
                        score_edit_rule = ?,
                        score_edit_value = ?
                    WHERE
                        participant_id = ?
                        AND attempt_id = ?
                        AND item_id = ?
                    ",
                )
                .bind(rule.map(|(rule, _)| rule.as_str()))
                .bind(rule.map(|(_, value)| value))
                .bind(participant)
                .bind(attempt)
                .bind(item)
                .execute(&mut **tx)
                .await?)
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch_result(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        item: ItemId,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        self.tx(async |tx| {
            query(
                "
                UPDATE
                    results
                SET
                    latest_activity_at = MAX(latest_activity_at, ?)
                WHERE
                    participant_id = ?
                    AND attempt_id = ?
                    AND item_id = ?
                ",
            )
            .bind(now)
            .bind(participant)
            .bind(attempt)
            .bind(item)
            .execute(&mut **tx)
            .await?;
            Ok(())
        })
        .await
    }

    async fn linked_child_results(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        child: ItemId,
    ) -> Result<Vec<ItemResult>, StoreError> {
        let sql = format!(
            "
            SELECT {RESULT_COLUMNS}
            FROM
                results
            JOIN attempts
                ON attempts.participant_id = results.participant_id
                AND attempts.id = results.attempt_id
            WHERE
                results.participant_id = ?1
                AND results.item_id = ?2
                AND (
                    results.attempt_id = ?3
                    OR (attempts.root_item_id = ?2 AND attempts.parent_attempt_id = ?3)
                )
            ORDER BY
                results.attempt_id
            "
        );
        let rows = self
            .tx(async |tx| {
                Ok(query_as::<_, ResultRow>(&sql)
                    .bind(participant)
                    .bind(child)
                    .bind(attempt)
                    .fetch_all(&mut **tx)
                    .await?)
            })
            .await?;
        into_results(rows)
    }

    async fn mark_item_results(
        &self,
        item: ItemId,
        state: PropagationState,
    ) -> Result<u64, StoreError> {
        let result = self
            .tx(async |tx| {
                Ok(query(
                    "
                    UPDATE
                        results
                    SET
                        propagation_state = ?
                    WHERE
                        item_id = ?
                        AND propagation_state = 'done'
                    ",
                )
                .bind(state.as_str())
                .bind(item)
                .execute(&mut **tx)
                .await?)
            })
            .await?;
        Ok(result.rows_affected())
    }

    async fn mark_child_results_below(
        &self,
        group: GroupId,
        item: ItemId,
        now: Timestamp,
    ) -> Result<u64, StoreError> {
        let result = self
            .tx(async |tx| {
                Ok(query(
                    "
                    UPDATE
                        results
                    SET
                        propagation_state = 'to_be_propagated'
                    WHERE
                        propagation_state = 'done'
                        AND item_id IN (
                            SELECT
                                child_item_id
                            FROM
                                items_items
                            WHERE
                                parent_item_id = ?1
                        )
                        AND participant_id IN (
                            SELECT
                                child_group_id
                            FROM
                                groups_ancestors
                            WHERE
                                ancestor_group_id = ?2
                                AND (expires_at IS NULL OR expires_at > ?3)
                        )
                    ",
                )
                .bind(item)
                .bind(group)
                .bind(now)
                .execute(&mut **tx)
                .await?)
            })
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_answer(&self, answer: &Answer) -> Result<(), StoreError> {
        self.tx(async |tx| {
            query(
                "
                INSERT INTO
                    answers (
                        id,
                        participant_id,
                        attempt_id,
                        item_id,
                        author_id,
                        answer,
                        submitted_at
                    )
                VALUES
                    (?, ?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(answer.id)
            .bind(answer.participant)
            .bind(answer.attempt)
            .bind(answer.item)
            .bind(answer.author)
            .bind(&answer.answer)
            .bind(answer.submitted_at)
            .execute(&mut **tx)
            .await?;
            Ok(())
        })
        .await
    }

    async fn answer(&self, id: AnswerId) -> Result<Option<Answer>, StoreError> {
        let row = self
            .tx(async |tx| {
                Ok(query_as::<_, AnswerRow>(
                    "
                    SELECT
                        id,
                        participant_id,
                        attempt_id,
                        item_id,
                        author_id,
                        answer,
                        submitted_at
                    FROM
                        answers
                    WHERE
                        id = ?
                    ",
                )
                .bind(id)
                .fetch_optional(&mut **tx)
                .await?)
            })
            .await?;
        Ok(row.map(Answer::from))
    }

    async fn graded_answers(
        &self,
        participant: GroupId,
        attempt: AttemptId,
        item: ItemId,
    ) -> Result<Vec<(Answer, Option<Grading>)>, StoreError> {
        let rows = self
            .tx(async |tx| {
                Ok(query_as::<_, GradedAnswerRow>(
                    "
                    SELECT
                        answers.id,
                        answers.participant_id,
                        answers.attempt_id,
                        answers.item_id,
                        answers.author_id,
                        answers.answer,
                        answers.submitted_at,
                        gradings.score,
                        gradings.graded_at
                    FROM
                        answers
                    LEFT JOIN gradings
                        ON gradings.answer_id = answers.id
                    WHERE
                        answers.participant_id = ?
                        AND answers.attempt_id = ?
                        AND answers.item_id = ?
                    ORDER BY
                        answers.submitted_at,
                        answers.id
                    ",
                )
                .bind(participant)
                .bind(attempt)
                .bind(item)
                .fetch_all(&mut **tx)
                .await?)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let answer = Answer::from(row.answer);
                let grading = match (row.score, row.graded_at) {
                    (Some(score), Some(graded_at)) => Some(Grading {
                        answer: answer.id,
                        score,
                        graded_at,
                    }),
                    _ => None,
                };
                (answer, grading)
            })
            .collect())
    }

    async fn grading(&self, answer: AnswerId) -> Result<Option<Grading>, StoreError> {
        let row: Option<(f64, Timestamp)> = self
            .tx(async |tx| {
                Ok(
                    query_as("SELECT score, graded_at FROM gradings WHERE answer_id = ?")
                        .bind(answer)
                        .fetch_optional(&mut **tx)
                        .await?,
                )
            })
            .await?;
        Ok(row.map(|(score, graded_at)| Grading {
            answer,
            score,
            graded_at,
        }))
    }

    async fn insert_grading(&self, grading: &Grading) -> Result<(), StoreError> {
        self.tx(async |tx| {
            query(
                "
                INSERT INTO
                    gradings (
                        answer_id,
                        score,
                        graded_at
                    )
                VALUES
                    (?, ?, ?)
                ",
            )
            .bind(grading.answer)
            .bind(grading.score)
            .bind(grading.graded_at)
            .execute(&mut **tx)
            .await?;
            Ok(())
        })
        .await
    }
}
