use std::sync::Mutex;

use protofit_types::{exercise::Exercise, ProtofitError, Result};

use crate::lock;

/// The exercise selection control. Read on every tick, so a change takes
/// effect on the next request without restarting capture.
#[derive(Debug)]
pub struct ExerciseSelector {
    options: Vec<Exercise>,
    selected: Mutex<usize>,
}

impl ExerciseSelector {
    pub fn new(options: Vec<Exercise>, initial: usize) -> Result<Self> {
        if options.is_empty() {
            return Err(ProtofitError::Configuration(
                "exercise selector needs at least one option".into(),
            ));
        }
        let initial = initial.min(options.len() - 1);
        Ok(Self {
            options,
            selected: Mutex::new(initial),
        })
    }

    pub fn options(&self) -> &[Exercise] {
        &self.options
    }

    pub fn index(&self) -> usize {
        *lock(&self.selected)
    }

    pub fn current(&self) -> Exercise {
        self.options[self.index()].clone()
    }

    pub fn select(&self, exercise: &Exercise) -> Result<Exercise> {
        let position = self
            .options
            .iter()
            .position(|option| option == exercise)
            .ok_or_else(|| {
                ProtofitError::Configuration(format!("unknown exercise '{exercise}'"))
            })?;
        *lock(&self.selected) = position;
        Ok(exercise.clone())
    }

    pub fn select_index(&self, index: usize) -> Result<Exercise> {
        let exercise = self.options.get(index).cloned().ok_or_else(|| {
            ProtofitError::Configuration(format!(
                "exercise index {index} out of range (0..{})",
                self.options.len()
            ))
        })?;
        *lock(&self.selected) = index;
        Ok(exercise)
    }

    pub fn next(&self) -> Exercise {
        let mut selected = lock(&self.selected);
        *selected = (*selected + 1) % self.options.len();
        self.options[*selected].clone()
    }

    pub fn previous(&self) -> Exercise {
        let mut selected = lock(&self.selected);
        *selected = (*selected + self.options.len() - 1) % self.options.len();
        self.options[*selected].clone()
    }
}
