//! Canned follow-up prompts the orchestrator sends on the model's behalf.

/// Situation names for the closed set of follow-up prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    SameError,
    ErrorFunctionsBased,
    ErrorTextBased,
    OutputFunctionBased,
    OutputTextBased,
}

impl FollowUp {
    pub fn name(self) -> &'static str {
        match self {
            FollowUp::SameError => "SameError",
            FollowUp::ErrorFunctionsBased => "ErrorFunctionsBased",
            FollowUp::ErrorTextBased => "ErrorTextBased",
            FollowUp::OutputFunctionBased => "OutputFunctionBased",
            FollowUp::OutputTextBased => "OutputTextBased",
        }
    }

    pub fn template(self) -> &'static str {
        match self {
            FollowUp::SameError => {
                "\nYou have already told me to fix the error. Please provide more information.\n"
            }
            FollowUp::ErrorFunctionsBased => concat!(
                "\nPlease check the ChatRequestToolMessage for the error output from the code. ",
                "If the code needs user input then say EXACTLY 'Please provide more information'. ",
                "If it is a Python syntax error try adding a blank line after an indentation is complete.\n",
            ),
            FollowUp::ErrorTextBased => concat!(
                "\nPlease check the following for the error output from the code. ",
                "If the code needs user input then say EXACTLY 'Please provide more information'. ",
                "If it is a Python syntax error try adding a blank line after an indentation is complete.\n",
                "Code output:\n\n",
            ),
            FollowUp::OutputFunctionBased => concat!(
                "\nPlease check the ChatRequestToolMessage for output for the code. ",
                "If this is not what you were expecting then please fix the code. ",
                "If it is what you were expecting please move on to the next step and only the next step. ",
                "If the task is done say EXACTLY 'The task is done.'\n",
            ),
            FollowUp::OutputTextBased => concat!(
                "\nPlease check the following for output for the code. ",
                "If this is not what you were expecting then please fix the code. ",
                "If it is what you were expecting please move on to the next step and only the next step. ",
                "If the task is done say EXACTLY 'The task is done.'\n",
                " Code output:\n\n",
            ),
        }
    }

    /// Text-based prompts carry the run output inline.
    pub fn carries_output(self) -> bool {
        matches!(self, FollowUp::ErrorTextBased | FollowUp::OutputTextBased)
    }

    pub fn render(self, output: &str) -> String {
        if self.carries_output() {
            format!("{}{}", self.template(), output)
        } else {
            self.template().to_string()
        }
    }

    /// Prompt for a finished run, by outcome and calling style.
    pub fn after_run(had_error: bool, function_based: bool) -> Self {
        match (had_error, function_based) {
            (true, true) => FollowUp::ErrorFunctionsBased,
            (true, false) => FollowUp::ErrorTextBased,
            (false, true) => FollowUp::OutputFunctionBased,
            (false, false) => FollowUp::OutputTextBased,
        }
    }
}
