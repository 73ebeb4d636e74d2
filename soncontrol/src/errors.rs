use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Unknown session '{0}'")]
    UnknownSession(Uuid),

    // Erreurs du fournisseur de thèmes (thème ou preset inconnu)
    #[error(transparent)]
    Theme(#[from] sontheme::ThemeError),

    // Erreurs de la couche canaux (pool épuisé, chargement en cours)
    #[error(transparent)]
    Stream(#[from] sonstream::StreamError),
}
