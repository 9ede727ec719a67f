use strsim::sorensen_dice;

/// Minimum bigram similarity for a catalog variant to count as a hit.
pub const DEFAULT_FAQ_THRESHOLD: f64 = 0.6;

struct FaqEntry {
    variants: &'static [&'static str],
    answer: &'static str,
}

// Canonical question variants and their canned answers. Matching is fuzzy,
// so the variants only need to cover the common phrasings.
const FAQS: &[FaqEntry] = &[
    FaqEntry {
        variants: &[
            "¿Dónde está ubicado el colegio?",
            "¿Dónde queda el colegio?",
            "¿Cuál es la dirección del colegio?",
            "¿Dónde se encuentra su sede?",
            "Ubicación del colegio",
        ],
        answer: "Nos ubicamos en Av. Aviación 445, Cerro Colorado – Arequipa.",
    },
    FaqEntry {
        variants: &[
            "¿Cuál es la misión del colegio?",
            "¿Qué misión tiene el colegio?",
            "¿Cuál es su propósito?",
            "¿Qué objetivos tiene el colegio?",
            "Misión del colegio",
        ],
        answer: "Formar estudiantes comprometidos con la fe, la excelencia y los valores de “Luz y Verdad”.",
    },
    FaqEntry {
        variants: &[
            "¿Puedo agendar una entrevista de admisión?",
            "¿Se puede programar una entrevista?",
            "¿Puedo reservar una cita de admisión?",
            "¿Cómo agendo una entrevista?",
            "Entrevista de admisión",
        ],
        answer: "Claro. Podemos agendarla para usted. ¿Prefiere presencial o virtual?",
    },
    FaqEntry {
        variants: &[
            "¿Qué idiomas enseñan?",
            "¿Tienen clases de inglés?",
            "¿Qué lenguas enseñan en el colegio?",
            "¿Enseñan inglés en su escuela?",
            "Idiomas del colegio",
        ],
        answer: "Contamos con un programa de inglés certificado por Cambridge.",
    },
    FaqEntry {
        variants: &[
            "¿Qué documentos se necesitan para postular?",
            "¿Qué requisitos debo cumplir?",
            "¿Cuáles son los documentos necesarios para la admisión?",
            "Documentos para postular",
            "Requisitos de admisión",
        ],
        answer: "Puede consultarlo en la sección de requisitos. ¿Le gustaría que le muestre?",
    },
    FaqEntry {
        variants: &[
            "¿Qué horario de atención tienen?",
            "¿Cuál es el horario de atención?",
            "¿A qué hora están abiertos?",
            "Horario de atención",
            "¿En qué horario atienden?",
        ],
        answer: "Atendemos de lunes a viernes de 8:00 a 16:00.",
    },
];

/// Return the canned answer for the first catalog variant whose similarity
/// to `message` reaches `threshold`, or `None` when nothing comes close
/// enough and the message should fall through to the automation webhook.
pub fn faq_answer(message: &str, threshold: f64) -> Option<&'static str> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return None;
    }

    for faq in FAQS {
        for variant in faq.variants {
            if sorensen_dice(trimmed, variant) >= threshold {
                return Some(faq.answer);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_variant_matches() {
        let answer = faq_answer("¿Dónde queda el colegio?", DEFAULT_FAQ_THRESHOLD);
        assert_eq!(
            answer,
            Some("Nos ubicamos en Av. Aviación 445, Cerro Colorado – Arequipa.")
        );
    }

    #[test]
    fn near_variant_matches_above_threshold() {
        // Not in the catalog verbatim; close to the location variants.
        let answer = faq_answer("¿Dónde está el colegio?", DEFAULT_FAQ_THRESHOLD);
        assert_eq!(
            answer,
            Some("Nos ubicamos en Av. Aviación 445, Cerro Colorado – Arequipa.")
        );
    }

    #[test]
    fn unrelated_message_misses() {
        assert_eq!(
            faq_answer("necesito ayuda con mi pedido", DEFAULT_FAQ_THRESHOLD),
            None
        );
    }

    #[test]
    fn empty_message_misses() {
        assert_eq!(faq_answer("   ", DEFAULT_FAQ_THRESHOLD), None);
    }

    #[test]
    fn threshold_is_respected() {
        // At a threshold of 1.0 only verbatim variants hit.
        assert_eq!(faq_answer("¿Dónde está el colegio?", 1.0), None);
        assert!(faq_answer("Horario de atención", 1.0).is_some());
    }
}
