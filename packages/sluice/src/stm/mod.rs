//! Software transactional memory.
//!
//! Shared state lives in [`TRef`] cells and is read and written only inside
//! [`Stm`] expressions, which are inert descriptions until executed by
//! [`Stm::commit`] / [`atomically`]. Each execution journals its reads and
//! writes, then validates and applies the journal atomically: concurrent
//! transactions behave as if they ran one at a time, and a conflicting
//! attempt is re-executed invisibly.
//!
//! ```ignore
//! let account_a = TRef::make_commit(100);
//! let account_b = TRef::make_commit(200);
//!
//! // move 50 from a to b, atomically
//! let transfer = account_a
//!     .update(|a| a - 50)
//!     .flat_map({
//!         let account_b = account_b.clone();
//!         move |()| account_b.update(|b| b + 50)
//!     });
//! transfer.commit().await?;
//! ```
//!
//! [`Stm::retry`] parks the transaction until another commit writes one of
//! the references it read; [`Stm::or_else`] tries an alternative instead of
//! parking. Both discard the abandoned attempt's tentative writes
//! completely.

pub(crate) mod expr;
mod journal;
mod run;
mod tref;

pub use expr::{Either, Env, Stm, StmValue};
pub use run::{atomically, Commit};
pub use tref::TRef;


#[cfg(test)]
mod tests {
    use super::*;
    use std::{future::Future, sync::Arc, time::Duration};

    // read a ref outside any larger transaction
    async fn read<T: StmValue>(tref: &TRef<T>) -> T {
        tref.get::<&'static str>().commit().await.unwrap()
    }

    #[tokio::test]
    async fn succeed_and_fail() {
        assert_eq!(Stm::<i32, &str>::succeed(42).commit().await, Ok(42));
        assert_eq!(Stm::<i32, &str>::fail("boom").commit().await, Err("boom"));
        assert_eq!(atomically(Stm::<i32, &str>::succeed(7)).await, Ok(7));
    }

    #[tokio::test]
    async fn get_set_update() {
        let tref = TRef::make_commit(1);
        assert_eq!(read(&tref).await, 1);

        tref.set::<&str>(5).commit().await.unwrap();
        assert_eq!(read(&tref).await, 5);

        tref.update::<&str>(|x| x * 2).commit().await.unwrap();
        assert_eq!(read(&tref).await, 10);

        assert_eq!(tref.get_and_update::<&str>(|x| x + 1).commit().await, Ok(10));
        assert_eq!(tref.update_and_get::<&str>(|x| x + 1).commit().await, Ok(12));
        assert_eq!(tref.modify::<_, &str>(|x| (x * 100, 0)).commit().await, Ok(1200));
        assert_eq!(read(&tref).await, 0);
    }

    #[tokio::test]
    async fn read_your_own_writes() {
        let tref = TRef::make_commit(0);
        let observed = tref
            .set::<&str>(42)
            .flat_map({
                let tref = tref.clone();
                move |()| tref.get()
            })
            .commit()
            .await;
        assert_eq!(observed, Ok(42));
    }

    #[tokio::test]
    async fn make_inside_transaction() {
        let tref = TRef::<i32>::make::<&str>(7)
            .flat_map(|tref| tref.update(|x| x + 1).map(move |()| tref.clone()))
            .commit()
            .await
            .unwrap();
        assert_eq!(read(&tref).await, 8);
    }

    #[tokio::test]
    async fn fold_handles_failure() {
        let folded = Stm::<i32, &str>::fail("nope")
            .fold(|e| format!("err:{e}"), |a| format!("ok:{a}"))
            .commit()
            .await;
        assert_eq!(folded, Ok::<_, &str>("err:nope".to_owned()));

        let recovered = Stm::<i32, &str>::fail("nope")
            .fold_stm(|_| Stm::succeed(0), Stm::succeed)
            .commit()
            .await;
        assert_eq!(recovered, Ok::<_, &str>(0));
    }

    #[tokio::test]
    async fn map_error_transforms_failure() {
        let result = Stm::<i32, i32>::fail(4)
            .map_error(|e| e * 10)
            .commit()
            .await;
        assert_eq!(result, Err(40));
    }

    #[tokio::test]
    async fn or_else_discards_left_journal() {
        let tref = TRef::make_commit(0i64);
        let left = tref
            .update::<&str>(|x| x + 100)
            .flat_map(|()| Stm::retry());
        let right = tref.update::<&str>(|x| x + 200);
        left.or_else(right).commit().await.unwrap();
        // no trace of the abandoned +100 may remain
        assert_eq!(read(&tref).await, 200);
    }

    #[tokio::test]
    async fn or_else_keeps_left_journal_on_success() {
        let tref = TRef::make_commit(0i64);
        let left = tref.update::<&str>(|x| x + 1);
        let right = tref.update::<&str>(|x| x + 10);
        left.or_else(right).commit().await.unwrap();
        assert_eq!(read(&tref).await, 1);
    }

    #[tokio::test]
    async fn or_else_catches_failure() {
        let result = Stm::<i32, &str>::fail("left")
            .or_else(Stm::succeed(9))
            .commit()
            .await;
        assert_eq!(result, Ok::<_, &str>(9));

        assert_eq!(
            Stm::<i32, &str>::succeed(1).or_else_fail("never").commit().await,
            Ok(1),
        );
        assert_eq!(
            Stm::<i32, &str>::retry().or_else_fail("fell through").commit().await,
            Err("fell through"),
        );
        assert_eq!(
            Stm::<i32, &str>::retry().or_else_succeed(3).commit().await,
            Ok::<_, &str>(3),
        );
    }

    #[tokio::test]
    async fn or_else_either_tags_the_side() {
        let left = Stm::<i32, &str>::succeed(1).or_else_either(Stm::<u8, &str>::succeed(2));
        assert_eq!(left.commit().await, Ok(Either::Left(1)));

        let right = Stm::<i32, &str>::retry().or_else_either(Stm::<u8, &str>::succeed(2));
        assert_eq!(right.commit().await, Ok(Either::Right(2)));
    }

    #[tokio::test]
    async fn when_and_when_stm() {
        let tref = TRef::make_commit(0);
        Stm::when(true, tref.update::<&str>(|x| x + 1)).commit().await.unwrap();
        Stm::when(false, tref.update::<&str>(|x| x + 1)).commit().await.unwrap();
        assert_eq!(read(&tref).await, 1);

        let gate = TRef::make_commit(true);
        let ran = Stm::when_stm(gate.get::<&str>(), tref.get()).commit().await;
        assert_eq!(ran, Ok(Some(1)));
        gate.set::<&str>(false).commit().await.unwrap();
        let skipped = Stm::when_stm(gate.get::<&str>(), tref.get()).commit().await;
        assert_eq!(skipped, Ok(None));
    }

    #[tokio::test]
    async fn when_case_selects_by_value() {
        let chosen = Stm::<i32, &str>::when_case(3, |n| {
            (*n > 0).then(|| Stm::succeed(*n * 10))
        });
        assert_eq!(chosen.commit().await, Ok(Some(30)));

        let skipped = Stm::<i32, &str>::when_case(-3, |n| {
            (*n > 0).then(|| Stm::succeed(*n * 10))
        });
        assert_eq!(skipped.commit().await, Ok(None));

        let from_ref = TRef::make_commit(5);
        let via_stm = Stm::<i32, &str>::when_case_stm(from_ref.get(), |n| {
            (*n > 0).then(|| Stm::succeed(*n + 1))
        });
        assert_eq!(via_stm.commit().await, Ok(Some(6)));
    }

    #[tokio::test]
    async fn merge_and_reduce() {
        let merged = Stm::<i32, &str>::merge_all(
            (1..=4).map(Stm::succeed),
            100,
            |acc, n| acc + n,
        );
        assert_eq!(merged.commit().await, Ok(110));

        let reduced = Stm::<i32, &str>::reduce_all(
            Stm::succeed(1),
            (2..=4).map(Stm::succeed),
            |a, b| a.max(b),
        );
        assert_eq!(reduced.commit().await, Ok(4));
    }

    #[tokio::test]
    async fn validate_accumulates_all_errors_in_order() {
        let even_or_fail = |n: i32| {
            if n % 2 == 0 {
                Stm::<i32, i32>::succeed(n)
            } else {
                Stm::fail(n)
            }
        };
        let mixed = Stm::validate([1, 2, 3, 4, 5], even_or_fail);
        assert_eq!(mixed.commit().await, Err(vec![1, 3, 5]));

        let all_even = Stm::validate([0, 2, 4], even_or_fail);
        assert_eq!(all_even.commit().await, Ok(vec![0, 2, 4]));
    }

    #[tokio::test]
    async fn validate_first_short_circuits() {
        let tally = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let even_or_fail = {
            let tally = Arc::clone(&tally);
            move |n: i32| {
                tally.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                if n % 2 == 0 {
                    Stm::<i32, i32>::succeed(n)
                } else {
                    Stm::fail(n)
                }
            }
        };
        let found = Stm::validate_first([1, 3, 4, 5], even_or_fail);
        assert_eq!(found.commit().await, Ok(4));
        // 5 was never checked
        assert_eq!(tally.load(std::sync::atomic::Ordering::Relaxed), 3);

        let none = Stm::validate_first([1, 3, 5], |n: i32| {
            if n % 2 == 0 {
                Stm::<i32, i32>::succeed(n)
            } else {
                Stm::fail(n)
            }
        });
        assert_eq!(none.commit().await, Err(vec![1, 3, 5]));
    }

    #[tokio::test]
    async fn environment_provision() {
        #[derive(Debug, Clone, PartialEq)]
        struct Config {
            base: i32,
        }

        let doubled = Stm::<Config, &str>::service()
            .map(|config| config.base * 2)
            .provide_environment(Env::new().with(Config { base: 21 }));
        assert_eq!(doubled.commit().await, Ok(42));

        // inner provide shadows the outer one
        let shadowed = Stm::<Config, &str>::service()
            .map(|config| config.base)
            .provide_environment(Env::new().with(Config { base: 1 }))
            .provide_environment(Env::new().with(Config { base: 2 }));
        assert_eq!(shadowed.commit().await, Ok(1));
    }

    #[tokio::test]
    async fn stack_safety_deep_map_chain() {
        let stm = (0..10_000).fold(Stm::<i64, &str>::succeed(0), |acc, _| {
            acc.map(|x| x + 1)
        });
        assert_eq!(stm.commit().await, Ok(10_000));
    }

    #[tokio::test]
    async fn stack_safety_deep_flat_map_chain() {
        let tref = TRef::make_commit(0i64);
        let stm = (0..10_000).fold(tref.get::<&str>(), |acc, _| {
            let tref = tref.clone();
            acc.flat_map(move |_| tref.update_and_get(|x| x + 1))
        });
        assert_eq!(stm.commit().await, Ok(10_000));
        assert_eq!(read(&tref).await, 10_000);
    }

    #[tokio::test]
    async fn stack_safety_deep_fold_chain() {
        let stm = (0..10_000).fold(Stm::<i64, &str>::succeed(0), |acc, _| {
            acc.fold(|_| -1, |x| x + 1)
        });
        assert_eq!(stm.commit().await, Ok::<_, &str>(10_000));
    }

    #[tokio::test]
    async fn stack_safety_deep_or_else_chain() {
        let stm = (0..10_000).fold(Stm::<i64, &str>::succeed(7), |acc, _| {
            acc.or_else(Stm::succeed(-1))
        });
        assert_eq!(stm.commit().await, Ok::<_, &str>(7));
    }

    #[tokio::test]
    async fn stack_safety_deep_provide_chain() {
        let stm = (0..10_000).fold(Stm::<i64, &str>::succeed(7), |acc, _| {
            acc.provide_environment(Env::new())
        });
        assert_eq!(stm.commit().await, Ok(7));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_all_applied() {
        let counter = TRef::make_commit(0i64);
        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let counter = counter.clone();
                tokio::spawn(async move {
                    for _ in 0..100 {
                        counter.update::<&str>(|x| x + 1).commit().await.unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(read(&counter).await, 1000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_never_observe_partial_writes() {
        // one transaction moves both cells together; a reader summing them
        // must see 0 or 2, never 1
        let cell_a = TRef::make_commit(0i64);
        let cell_b = TRef::make_commit(0i64);

        let writer = {
            let cell_a = cell_a.clone();
            let cell_b = cell_b.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let bump = cell_a.update::<&str>(|x| x + 1).flat_map({
                        let cell_b = cell_b.clone();
                        move |()| cell_b.update(|x| x + 1)
                    });
                    bump.commit().await.unwrap();

                    let unbump = cell_a.update::<&str>(|x| x - 1).flat_map({
                        let cell_b = cell_b.clone();
                        move |()| cell_b.update(|x| x - 1)
                    });
                    unbump.commit().await.unwrap();
                }
            })
        };
        let reader = {
            let cell_a = cell_a.clone();
            let cell_b = cell_b.clone();
            tokio::spawn(async move {
                for _ in 0..2000 {
                    let sum = cell_a
                        .get::<&str>()
                        .flat_map({
                            let cell_b = cell_b.clone();
                            move |a| cell_b.get().map(move |b| a + b)
                        })
                        .commit()
                        .await
                        .unwrap();
                    assert!(sum == 0 || sum == 2, "observed partial write: sum = {sum}");
                }
            })
        };

        writer.await.unwrap();
        reader.await.unwrap();
        let final_sum = read(&cell_a).await + read(&cell_b).await;
        assert_eq!(final_sum, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retry_parks_until_a_tracked_ref_changes() {
        let tref = TRef::make_commit(0);
        let waiter = {
            let tref = tref.clone();
            tokio::spawn(async move {
                // parks until the value becomes 1, then bumps it to 2
                tref.get::<&str>()
                    .flat_map(|x| Stm::check(x == 1))
                    .flat_map({
                        let tref = tref.clone();
                        move |()| tref.set(2)
                    })
                    .commit()
                    .await
                    .unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tref.set::<&str>(1).commit().await.unwrap();
        waiter.await.unwrap();
        assert_eq!(read(&tref).await, 2);
    }

    #[tokio::test]
    async fn dropping_a_parked_commit_unregisters_it() {
        let tref = TRef::make_commit(0);
        let mut parked = tref
            .get::<&str>()
            .flat_map(|x| Stm::check(x == 1))
            .commit();
        // park it
        let first = futures::future::poll_fn(|cx| {
            std::task::Poll::Ready(std::pin::Pin::new(&mut parked).poll(cx))
        })
        .await;
        assert!(first.is_pending());
        drop(parked);

        // a later write finds no stale waiter to trip over
        tref.set::<&str>(1).commit().await.unwrap();
        assert_eq!(read(&tref).await, 1);
    }

    #[tokio::test]
    async fn check_succeeds_immediately_when_true() {
        let tref = TRef::make_commit(10);
        let guarded = tref
            .get::<&str>()
            .flat_map(|x| Stm::check(x > 5).map(move |()| x));
        assert_eq!(guarded.commit().await, Ok(10));
    }

    #[tokio::test]
    async fn ignore_discards_both_channels() {
        assert_eq!(Stm::<i32, &str>::succeed(1).ignore().commit().await, Ok(()));
        assert_eq!(Stm::<i32, &str>::fail("gone").ignore().commit().await, Ok(()));
    }

    #[test]
    fn deep_descriptions_drop_without_recursion() {
        let stm = (0..100_000).fold(Stm::<i64, &str>::succeed(0), |acc, _| {
            acc.map(|x| x + 1)
        });
        drop(stm);
    }
}
