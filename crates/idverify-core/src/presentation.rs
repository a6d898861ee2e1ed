//! Outputs of the verification machine, consumed by whatever renders them.

use crate::reference::ReferenceSubject;
use crate::types::Rect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure,
}

/// What the user is currently being asked or told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    /// Idle: present an ID card.
    SubmitReference,
    /// Reference is ready; waiting for a usable live face.
    LookAtCamera,
    Comparing,
    /// Final decision. `display_name` is the card holder's name; a failure
    /// invites the user to try again.
    Result {
        verdict: Verdict,
        display_name: String,
    },
}

/// Audio feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    LookAtScreen,
    CompareSuccess,
    CompareFail,
}

/// Receiver of everything the machine wants shown or played.
///
/// Called from the orchestrator task only, in the order events happen.
pub trait PresentationSink {
    fn show_prompt(&mut self, prompt: Prompt);

    /// Face rectangle in view coordinates, or `None` to clear it.
    fn update_overlay(&mut self, rect: Option<Rect>);

    fn play_cue(&mut self, cue: Cue);

    /// The reference subject's feature is ready; its photo can be shown.
    fn show_reference(&mut self, _subject: &ReferenceSubject) {}
}

impl<P: PresentationSink + ?Sized> PresentationSink for Box<P> {
    fn show_prompt(&mut self, prompt: Prompt) {
        (**self).show_prompt(prompt)
    }

    fn update_overlay(&mut self, rect: Option<Rect>) {
        (**self).update_overlay(rect)
    }

    fn play_cue(&mut self, cue: Cue) {
        (**self).play_cue(cue)
    }

    fn show_reference(&mut self, subject: &ReferenceSubject) {
        (**self).show_reference(subject)
    }
}
