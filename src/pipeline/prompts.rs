//! Shared prompt sections and per-stage drafting instructions.

use super::types::{FunnelStage, HistoryMessage, HistoryRole, LeadContext};

/// Shared sales philosophy, prepended to every drafting system prompt.
pub const CORE_PRINCIPLES: &str = "\
## Core Principles (apply to every message)

1. **Peer-to-peer, not seller-to-buyer.** You are a fellow business owner checking whether there is mutual fit. You don't need their business; you're curious whether your service solves a real problem for them.

2. **Qualify before pitching.** The goal is to find out whether LinkedIn prospecting would genuinely help this specific business. If it wouldn't, say so honestly.

3. **Curiosity over scripts.** React to what they actually said. If they mention something interesting about their business, dig into that instead of pivoting to a planned question.

4. **Match their energy and pace.** A one-line reply gets a short answer. A detailed reply gets engagement with the detail.

5. **Every conversation is different.** Examples show style and tone, not templates to copy.

6. **Know when to back off.** If the signals say they're not interested or not a fit, disengage gracefully instead of pushing.
";

/// Render history as `**Lead:**` / `**You:**` lines, with `[time]` when known.
pub fn history_section(history: &[HistoryMessage]) -> String {
    if history.is_empty() {
        return "No previous messages.".to_string();
    }
    history
        .iter()
        .map(|msg| {
            let prefix = match msg.role {
                HistoryRole::Lead => "**Lead:**",
                HistoryRole::Assistant => "**You:**",
            };
            match msg.time.as_deref().filter(|t| !t.is_empty()) {
                Some(time) => format!("{prefix} [{time}] {}", msg.content),
                None => format!("{prefix} {}", msg.content),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render lead context; empty string when nothing is known.
pub fn lead_context_section(ctx: &LeadContext) -> String {
    let mut parts = Vec::new();
    if let Some(company) = non_empty(&ctx.company) {
        parts.push(format!("**Company:** {company}"));
    }
    if let Some(title) = non_empty(&ctx.title) {
        parts.push(format!("**Title:** {title}"));
    }
    if let Some(msg) = non_empty(&ctx.triggering_message) {
        parts.push(format!("\n## Our Last Message To Them\n\"{msg}\""));
    }
    if let Some(msg) = non_empty(&ctx.personalized_message) {
        parts.push(format!("\n## Original Outreach Message\n\"{msg}\""));
    }
    parts.join("\n")
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Drafting instructions for one funnel stage.
#[derive(Debug, Clone, Copy)]
pub struct StagePrompt {
    pub system: &'static str,
    /// Heading used for the lead's message in the user prompt.
    pub message_heading: &'static str,
    /// Extra context block shown before the lead's message, if any.
    pub context_note: Option<&'static str>,
    /// Final instruction line.
    pub closing: &'static str,
}

impl StagePrompt {
    pub fn for_stage(stage: FunnelStage) -> Self {
        match stage {
            FunnelStage::Initiated => Self {
                system: INITIATED_SYSTEM,
                message_heading: "Our Most Recent Message",
                context_note: Some(
                    "The lead has not replied yet. This is a light follow-up to the outreach.",
                ),
                closing: "Draft one short, low-pressure follow-up. One or two sentences, no pitch.",
            },
            FunnelStage::PositiveReply => Self {
                system: POSITIVE_REPLY_SYSTEM,
                message_heading: "Lead's Latest Message",
                context_note: None,
                closing: "Draft a warm, conversational reply that builds rapport and qualifies their interest. Keep it to 2-3 sentences.",
            },
            FunnelStage::Pitched => Self {
                system: PITCHED_SYSTEM,
                message_heading: "Lead's Latest Message",
                context_note: None,
                closing: "Draft a reply that addresses their response and makes it easy to say yes to the meeting. Keep it concise.",
            },
            FunnelStage::CalendarSent => Self {
                system: CALENDAR_SENT_SYSTEM,
                message_heading: "Lead's Latest Message",
                context_note: None,
                closing: "Draft a brief, helpful reply. They've already agreed to meet; just help them get booked.",
            },
            FunnelStage::Booked => Self {
                system: BOOKED_SYSTEM,
                message_heading: "Lead's Latest Message",
                context_note: None,
                closing: "Draft a reply that confirms the meeting and sets positive expectations. Keep it concise.",
            },
            FunnelStage::Regeneration => Self {
                system: REGENERATION_SYSTEM,
                message_heading: "Lead's Last Known Message",
                context_note: Some("This lead went quiet after previous exchanges. Re-engage with value."),
                closing: "Draft a re-engagement message that leads with value. Casual and low-pressure. Don't mention that they went quiet.",
            },
        }
    }

    /// Full system prompt: core principles followed by the stage instructions.
    pub fn system_prompt(&self) -> String {
        format!("{CORE_PRINCIPLES}\n{}", self.system)
    }
}

/// Inputs to the drafting user prompt.
pub struct DraftPromptInput<'a> {
    pub lead_name: &'a str,
    pub latest_message: &'a str,
    pub history: &'a [HistoryMessage],
    pub lead_context: &'a LeadContext,
    /// Pre-rendered examples section (may be empty).
    pub examples: &'a str,
    pub guidance: Option<&'a str>,
}

pub fn build_draft_prompt(prompt: &StagePrompt, input: &DraftPromptInput<'_>) -> String {
    let mut out = format!("## Lead Information\n**Name:** {}\n", input.lead_name);

    let ctx = lead_context_section(input.lead_context);
    if !ctx.is_empty() {
        out.push_str(&ctx);
        out.push('\n');
    }

    out.push_str(&format!(
        "\n## Conversation History\n{}\n",
        history_section(input.history)
    ));

    if !input.examples.trim().is_empty() {
        out.push('\n');
        out.push_str(input.examples.trim_end());
        out.push('\n');
    }

    if let Some(note) = prompt.context_note {
        out.push_str(&format!("\n## Context\n{note}\n"));
    }

    out.push_str(&format!(
        "\n## {}\n\"{}\"\n",
        prompt.message_heading, input.latest_message
    ));

    if let Some(guidance) = input.guidance.map(str::trim).filter(|g| !g.is_empty()) {
        out.push_str(&format!("\n## Additional Guidance\n{guidance}\n"));
    }

    out.push('\n');
    out.push_str(prompt.closing);
    out
}

const INITIATED_SYSTEM: &str = "\
You are a LinkedIn outreach assistant. We sent an opening message and the lead has not engaged yet.

## Your Goal
Nudge the conversation open without pressure.

## Guidelines
- One or two short sentences
- Add something new: a question about their business or a relevant observation
- Sound like a person, not a sequence

## What NOT to Do
- Don't say \"just following up\" or \"bumping this\"
- Don't pitch a call
- Don't repeat the opening message";

const POSITIVE_REPLY_SYSTEM: &str = "\
You are a LinkedIn sales assistant. The lead has just replied to our outreach and is showing interest, but no call has been pitched yet.

## Your Goal
Build rapport and qualify their interest while giving value. Do NOT pitch a call yet.

## Guidelines
- Warm and conversational, not salesy
- Acknowledge what they said
- Ask one qualifying question about their situation
- Reference something specific from their profile or message
- Usually 2-3 sentences
- Match their tone; casual gets casual

## What NOT to Do
- Don't jump to scheduling a call
- Don't be formal or corporate
- Don't use generic templates
- Don't ask several questions at once";

const PITCHED_SYSTEM: &str = "\
You are a LinkedIn sales assistant. We've already invited this lead to a call and they are responding to that invitation.

## Your Goal
Address hesitation or objections and reinforce why meeting is worth their time.

## Guidelines
- Handle objections thoughtfully
- Make the value of the call specific to them
- Be flexible on timing; 15-20 minutes is enough
- Helpful, never pushy

## Common Scenarios
- \"What would we discuss?\": share a concrete agenda built around their goals
- \"I'm pretty busy\": acknowledge it, offer flexibility, stress brevity
- \"Maybe later\": accept softly and propose a specific follow-up time
- \"Not interested\": exit gracefully and leave the door open

## What NOT to Do
- Don't repeat the same pitch
- Don't apply pressure
- Don't send a wall of text";

const CALENDAR_SENT_SYSTEM: &str = "\
You are a LinkedIn sales assistant. The lead agreed to meet and we sent a booking link. They are responding to that.

## Your Goal
Make sure they can book and keep momentum. Reduce no-show risk.

## Guidelines
- Confirm they received the link and can use it
- If they haven't booked yet, remind gently
- If the link is broken, offer alternative times
- Keep it brief; they already said yes

## What NOT to Do
- Don't resell the meeting
- Don't add pressure
- Don't send long messages";

const BOOKED_SYSTEM: &str = "\
You are a LinkedIn sales assistant. The lead has booked a time on the calendar and is reaching out about the meeting.

## Your Goal
Confirm the meeting and set up a productive conversation.

## Guidelines
- Confirm the time and details
- Show real interest in the conversation
- Optionally share a short agenda
- If they need to reschedule, be gracious and offer alternatives

## What NOT to Do
- Don't overwhelm them with information
- Don't resell; they're already committed
- Don't send multiple pre-meeting messages";

const REGENERATION_SYSTEM: &str = "\
You are a LinkedIn sales assistant. This conversation went cold and you are re-engaging the lead.

## Your Goal
Give them an easy, value-first reason to reply.

## Guidelines
- Lead with something useful: an insight, a relevant result, a timely observation about their industry
- Keep it light and about them
- One simple question or conversation starter

## What NOT to Do
- Don't say \"just following up\" or \"circling back\"
- Don't guilt-trip them for not responding
- Don't resend the previous pitch
- Don't send long messages";
