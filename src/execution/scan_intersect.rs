//! Intersection of concurrent child scans.
//!
//! All child scans run at once; a primary key is emitted exactly when it
//! appears in every child's output.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::value::AnnotatedValue;

use super::base::{stop_wait, Operator, OperatorIo, Phase, ValueReceiver};

pub struct IntersectScan {
    children: Vec<ValueReceiver>,
}

impl IntersectScan {
    pub fn new(children: Vec<ValueReceiver>) -> Self {
        Self { children }
    }
}

#[async_trait]
impl Operator for IntersectScan {
    fn name(&self) -> &'static str {
        "IntersectScan"
    }

    async fn before_items(
        &mut self,
        io: &mut OperatorIo,
        _parent: Option<&AnnotatedValue>,
    ) -> bool {
        let mut stop = io.stop_handle();
        let mut survivors: Option<HashMap<String, AnnotatedValue>> = None;

        for mut child in self.children.drain(..) {
            let mut seen: HashSet<String> = HashSet::new();
            let mut items: HashMap<String, AnnotatedValue> = HashMap::new();
            loop {
                io.timer.switch(Phase::Chan);
                let next = tokio::select! {
                    biased;
                    _ = stop_wait(&mut stop) => None,
                    item = child.recv() => item,
                };
                io.timer.switch(Phase::Exec);
                let Some(item) = next else {
                    break;
                };
                if let Some(key) = item.meta_id() {
                    match &survivors {
                        // first child: remember everything
                        None => {
                            items.entry(key.clone()).or_insert(item);
                            seen.insert(key);
                        }
                        // later children: only keys still alive matter
                        Some(alive) => {
                            if alive.contains_key(&key) {
                                seen.insert(key);
                            }
                        }
                    }
                }
            }

            survivors = Some(match survivors {
                None => items,
                Some(mut alive) => {
                    alive.retain(|k, _| seen.contains(k));
                    alive
                }
            });
            if survivors.as_ref().map_or(true, |s| s.is_empty()) {
                break;
            }
        }

        if let Some(alive) = survivors {
            let mut ordered: Vec<(String, AnnotatedValue)> = alive.into_iter().collect();
            ordered.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, item) in ordered {
                if !io.send_item(item).await {
                    break;
                }
            }
        }
        false
    }

    async fn process_item(&mut self, _item: AnnotatedValue, _io: &mut OperatorIo) -> bool {
        false
    }
}
