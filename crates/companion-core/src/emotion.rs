//! Heuristic emotion inference for assistant replies.
//!
//! Deterministic keyword and punctuation scoring. Every signal that
//! contributed is recorded in `reasons`.

use companion_types::emotion::{EmotionLabel, EmotionMetadata};

const INTENSITY_RANGE: (f64, f64) = (0.2, 1.0);
const CONFIDENCE_RANGE: (f64, f64) = (0.2, 0.95);

/// Per-label keyword lists, English and Chinese. Scanned in this order.
const KEYWORDS: &[(EmotionLabel, &[&str])] = &[
    (
        EmotionLabel::Angry,
        &[
            "angry", "furious", "annoyed", "outrageous", "how dare", "unacceptable", "生气",
            "愤怒", "气死", "讨厌", "可恶",
        ],
    ),
    (
        EmotionLabel::Sad,
        &[
            "sad", "sorry to hear", "unfortunately", "miss you", "heartbroken", "lonely", "难过",
            "伤心", "遗憾", "可惜", "想你",
        ],
    ),
    (
        EmotionLabel::Surprised,
        &[
            "wow", "really?", "no way", "unbelievable", "surprise", "what a", "哇", "真的吗",
            "没想到", "居然", "竟然",
        ],
    ),
    (
        EmotionLabel::Happy,
        &[
            "happy", "glad", "great", "awesome", "wonderful", "haha", "yay", "congrat", "开心",
            "高兴", "太好了", "哈哈", "恭喜",
        ],
    ),
    (
        EmotionLabel::Confident,
        &[
            "definitely", "certainly", "absolutely", "of course", "i'm sure", "trust me",
            "no doubt", "当然", "一定", "肯定", "放心",
        ],
    ),
    (
        EmotionLabel::Gentle,
        &[
            "take care", "gently", "it's okay", "don't worry", "rest", "hug", "慢慢", "别担心",
            "没关系", "抱抱", "休息",
        ],
    ),
];

/// Infer an emotion label for `text`, optionally steered by `hint`.
///
/// Returns `None` when both inputs are blank. The first keyword match in
/// the reply overrides the hint; the hint decides the label only when no
/// keyword matches.
pub fn infer_emotion(text: &str, hint: Option<&str>) -> Option<EmotionMetadata> {
    let text = text.trim();
    let hint = hint.map(str::trim).unwrap_or("");
    if text.is_empty() && hint.is_empty() {
        return None;
    }

    let mut reasons = Vec::new();

    let hint_label = normalize_label(hint);
    if let Some(label) = hint_label {
        reasons.push(format!("hint:{label}"));
    } else if !hint.is_empty() {
        reasons.push(format!("hint_unrecognized:{hint}"));
    }

    let keyword = match_keyword(text);
    if let Some((label, kw)) = keyword {
        reasons.push(format!("keyword:{label}:{kw}"));
    }

    let label = match (keyword, hint_label) {
        (Some((k, _)), _) => k,
        (None, Some(h)) => h,
        (None, None) => EmotionLabel::Neutral,
    };

    let intensity = score_intensity(text, label, &mut reasons);

    let mut confidence: f64 = 0.35;
    if hint_label.is_some() {
        confidence += 0.3;
    }
    if keyword.is_some() {
        confidence += 0.25;
    }
    if matches!((hint_label, keyword), (Some(h), Some((k, _))) if h == k) {
        confidence += 0.05;
        reasons.push("hint_keyword_agree".to_string());
    }
    let confidence = confidence.clamp(CONFIDENCE_RANGE.0, CONFIDENCE_RANGE.1);

    Some(EmotionMetadata {
        label,
        intensity,
        confidence,
        motion: motion_for(label, intensity).to_string(),
        reasons,
    })
}

/// Map a free-form emotion name onto the fixed label set.
pub fn normalize_label(raw: &str) -> Option<EmotionLabel> {
    let folded = raw.trim().to_lowercase();
    let label = match folded.as_str() {
        "neutral" | "calm_neutral" | "default" | "平静" => EmotionLabel::Neutral,
        "happy" | "joy" | "joyful" | "cheerful" | "excited" | "开心" | "高兴" => {
            EmotionLabel::Happy
        }
        "sad" | "sadness" | "upset" | "unhappy" | "难过" | "伤心" => EmotionLabel::Sad,
        "angry" | "anger" | "mad" | "furious" | "生气" => EmotionLabel::Angry,
        "surprised" | "surprise" | "shocked" | "amazed" | "惊讶" => EmotionLabel::Surprised,
        "confident" | "assertive" | "proud" | "自信" => EmotionLabel::Confident,
        "gentle" | "calm" | "soft" | "warm" | "tender" | "温柔" => EmotionLabel::Gentle,
        _ => return None,
    };
    Some(label)
}

fn match_keyword(text: &str) -> Option<(EmotionLabel, &'static str)> {
    if text.is_empty() {
        return None;
    }
    let lower = text.to_lowercase();
    KEYWORDS.iter().find_map(|(label, words)| {
        words
            .iter()
            .find(|w| lower.contains(**w))
            .map(|w| (*label, *w))
    })
}

fn score_intensity(text: &str, label: EmotionLabel, reasons: &mut Vec<String>) -> f64 {
    let exclaims = text.chars().filter(|c| matches!(c, '!' | '！')).count();
    let questions = text.chars().filter(|c| matches!(c, '?' | '？')).count();
    let ellipses = text.matches("...").count() + text.matches('…').count();

    let mut intensity: f64 = 0.4;
    if exclaims > 0 {
        intensity += (exclaims as f64 * 0.12).min(0.36);
        reasons.push(format!("exclamations:{exclaims}"));
    }
    if questions > 0 {
        intensity += (questions as f64 * 0.05).min(0.15);
        reasons.push(format!("questions:{questions}"));
    }
    if ellipses > 0 {
        let per = match label {
            EmotionLabel::Sad | EmotionLabel::Gentle => 0.08,
            _ => -0.05,
        };
        intensity += (ellipses as f64 * per).clamp(-0.15, 0.24);
        reasons.push(format!("ellipses:{ellipses}"));
    }
    intensity += match label {
        EmotionLabel::Angry => 0.15,
        EmotionLabel::Surprised => 0.1,
        EmotionLabel::Happy => 0.05,
        EmotionLabel::Confident => 0.05,
        EmotionLabel::Gentle => -0.05,
        EmotionLabel::Neutral => -0.1,
        EmotionLabel::Sad => 0.0,
    };
    intensity.clamp(INTENSITY_RANGE.0, INTENSITY_RANGE.1)
}

/// Animation tag for a label at a given intensity.
pub fn motion_for(label: EmotionLabel, intensity: f64) -> &'static str {
    let band = if intensity < 0.45 {
        0
    } else if intensity < 0.75 {
        1
    } else {
        2
    };
    let table: [&str; 3] = match label {
        EmotionLabel::Neutral => ["idle", "idle", "nod"],
        EmotionLabel::Happy => ["smile", "wave", "jump"],
        EmotionLabel::Sad => ["sigh", "droop", "cry"],
        EmotionLabel::Angry => ["frown", "cross_arms", "stomp"],
        EmotionLabel::Surprised => ["blink", "gasp", "startle"],
        EmotionLabel::Confident => ["nod", "thumbs_up", "fist_pump"],
        EmotionLabel::Gentle => ["tilt_head", "soft_smile", "open_arms"],
    };
    table[band]
}
